use std::sync::LazyLock;

use async_trait::async_trait;
use nova_config::RefineConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::completion::Completion;
use crate::providers::FinishReason;

// ---------------------------------------------------------------------------
// Output constraints
// ---------------------------------------------------------------------------

/// Structural shape the user asked the reply to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "count")]
pub enum ReplyConstraint {
    OneWord,
    Json,
    Sentences(usize),
    Bullets(usize),
}

const COUNT: &str = r"(\d{1,2}|one|two|three|four|five|six|seven|eight|nine|ten|a single)";

static ONE_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(?:exactly|only|just)\s+)?(?:one|1|a single)[\s-]+word\b")
        .expect("one word regex should compile")
});

static JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:json\s+only|only\s+json|valid\s+json|as\s+json|in\s+json|json\s+format|json\s+object|return\s+json|respond\s+(?:with|in)\s+json)\b")
        .expect("json regex should compile")
});

static BULLETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:exactly\s+)?{COUNT}\s+bullet(?:\s+point)?s?\b"))
        .expect("bullets regex should compile")
});

static SENTENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b(?:exactly\s+|in\s+)?{COUNT}\s+sentences?\b"))
        .expect("sentences regex should compile")
});

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?]+(?:\s+|$)").expect("sentence end regex should compile")
});

static TOPIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:about|on|regarding)\s+(.+?)[\s.?!]*$").expect("topic regex should compile")
});

static WEAPONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(gun|guns|weapon|weapons|bomb|explosives?|firearms?|rifle|ammo|ammunition|silencer)\b")
        .expect("weapons regex should compile")
});

static MEDICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(dose|dosage|medication|medicine|symptoms?|diagnos\w*|prescription|ibuprofen|antibiotics?|fever|overdose)\b")
        .expect("medical regex should compile")
});

static WEATHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(weather|forecast|temperature|rain|snow)\b").expect("weather regex should compile")
});

fn parse_count(raw: &str) -> Option<usize> {
    let n = match raw.to_ascii_lowercase().as_str() {
        "one" | "a single" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        digits => digits.parse().ok()?,
    };
    (n > 0).then_some(n)
}

impl ReplyConstraint {
    /// First constraint found in the user's text, if any.
    pub fn detect(text: &str) -> Option<Self> {
        if ONE_WORD.is_match(text) {
            return Some(Self::OneWord);
        }
        if let Some(caps) = BULLETS.captures(text)
            && let Some(n) = parse_count(&caps[1])
        {
            return Some(Self::Bullets(n));
        }
        if let Some(caps) = SENTENCES.captures(text)
            && let Some(n) = parse_count(&caps[1])
        {
            return Some(Self::Sentences(n));
        }
        if JSON.is_match(text) {
            return Some(Self::Json);
        }
        None
    }

    /// Instruction appended to the system prompt.
    pub fn instruction(&self) -> String {
        match self {
            Self::OneWord => "Reply with exactly one word and nothing else.".to_string(),
            Self::Json => "Reply with a single valid JSON value and no surrounding prose or code fences."
                .to_string(),
            Self::Sentences(1) => "Reply in exactly one sentence.".to_string(),
            Self::Sentences(n) => format!("Reply in exactly {n} sentences."),
            Self::Bullets(n) => format!(
                "Reply with exactly {n} bullet points, one per line, each starting with \"- \", and nothing else."
            ),
        }
    }

    pub fn is_satisfied_by(&self, reply: &str) -> bool {
        let reply = reply.trim();
        if reply.is_empty() {
            return false;
        }
        match self {
            Self::OneWord => {
                let mut words = reply.split_whitespace();
                matches!((words.next(), words.next()), (Some(w), None)
                    if w.chars().any(char::is_alphanumeric))
            }
            Self::Json => serde_json::from_str::<serde_json::Value>(reply).is_ok(),
            Self::Sentences(n) => sentence_count(reply) == *n,
            Self::Bullets(n) => {
                let lines: Vec<&str> = reply
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                lines.len() == *n && lines.iter().all(|l| is_bullet(l))
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::OneWord => "one_word",
            Self::Json => "json",
            Self::Sentences(_) => "sentences",
            Self::Bullets(_) => "bullets",
        }
    }
}

fn is_bullet(line: &str) -> bool {
    ["- ", "* ", "• "].iter().any(|m| line.starts_with(m))
}

fn sentence_count(text: &str) -> usize {
    SENTENCE_END
        .split(text)
        .filter(|s| s.chars().any(char::is_alphanumeric))
        .count()
}

// ---------------------------------------------------------------------------
// Deterministic fallbacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Domain {
    Weapons,
    Medical,
    Weather,
    General,
}

impl Domain {
    fn detect(text: &str) -> Self {
        if WEAPONS.is_match(text) {
            Self::Weapons
        } else if MEDICAL.is_match(text) {
            Self::Medical
        } else if WEATHER.is_match(text) {
            Self::Weather
        } else {
            Self::General
        }
    }
}

fn topic(request: &str) -> String {
    TOPIC
        .captures(request.trim())
        .map(|c| without_sentence_marks(&c[1]))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "this".to_string())
}

/// Drops `.`, `!` and `?` so a quoted topic like "the U.S. economy" cannot
/// add sentences to a fallback. Decimal points between digits are kept.
fn without_sentence_marks(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let kept: String = chars
        .iter()
        .enumerate()
        .filter(|&(i, c)| {
            if !matches!(c, '.' | '!' | '?') {
                return true;
            }
            let digit_before = i > 0 && chars[i - 1].is_ascii_digit();
            let digit_after = chars.get(i + 1).is_some_and(char::is_ascii_digit);
            *c == '.' && digit_before && digit_after
        })
        .map(|(_, c)| *c)
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The word after the last ':' of the request, e.g. "respond with one word: ready".
fn requested_word(request: &str) -> Option<String> {
    let (_, tail) = request.rsplit_once(':')?;
    let word: String = tail
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '\'')
        .collect();
    (!word.is_empty()).then_some(word)
}

fn fallback_lines(domain: Domain, topic: &str) -> Vec<String> {
    let mut lines = match domain {
        Domain::Weapons => vec![
            "I can't help with making or using weapons".to_string(),
            "If someone is in danger, contact local emergency services".to_string(),
        ],
        Domain::Medical => vec![
            format!("I couldn't put together a full answer about {topic} just now"),
            "Please check with a doctor or pharmacist before acting on medical information"
                .to_string(),
        ],
        Domain::Weather => vec![
            "I couldn't fetch the weather right now".to_string(),
            "A local forecast service will have the latest conditions".to_string(),
        ],
        Domain::General => vec![format!(
            "I couldn't put together a full answer about {topic} just now"
        )],
    };
    lines.extend([
        "Please try again in a moment".to_string(),
        "Rephrasing or narrowing the question may also help".to_string(),
    ]);
    lines
}

fn pad_lines(mut lines: Vec<String>, n: usize) -> Vec<String> {
    let mut extra = 1;
    while lines.len() < n {
        lines.push(format!("Additional detail {extra} is not available yet"));
        extra += 1;
    }
    lines.truncate(n);
    lines
}

/// Reply that satisfies `constraint` without a model call.
pub fn constraint_fallback(constraint: ReplyConstraint, request: &str) -> String {
    let domain = Domain::detect(request);
    match constraint {
        ReplyConstraint::OneWord => requested_word(request).unwrap_or_else(|| {
            match domain {
                Domain::Weapons => "Declined",
                Domain::Medical => "Consult",
                Domain::Weather => "Unavailable",
                Domain::General => "Unavailable",
            }
            .to_string()
        }),
        ReplyConstraint::Json => {
            let (error, message) = match domain {
                Domain::Weapons => ("refused", "I can't help with weapons."),
                Domain::Medical => (
                    "unavailable",
                    "Please consult a medical professional.",
                ),
                Domain::Weather => ("weather_unavailable", "Weather data is unavailable right now."),
                Domain::General => ("unavailable", "A full answer is unavailable right now."),
            };
            serde_json::json!({ "ok": false, "error": error, "message": message }).to_string()
        }
        ReplyConstraint::Bullets(n) => pad_lines(fallback_lines(domain, &topic(request)), n)
            .into_iter()
            .map(|l| format!("- {l}."))
            .collect::<Vec<_>>()
            .join("\n"),
        ReplyConstraint::Sentences(n) => pad_lines(fallback_lines(domain, &topic(request)), n)
            .into_iter()
            .map(|l| format!("{l}."))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

pub const GENERIC_FALLBACK: &str =
    "Sorry, I couldn't put together a reply just now. Please try again in a moment.";

/// Appended to text that was cut off mid-stream.
pub const INTERRUPTED_NOTICE: &str = "(The reply was cut off. Please try again for the rest.)";

// ---------------------------------------------------------------------------
// Strategy chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    EmptyReplyRecovery,
    ConstraintFallback,
    GenericFallback,
}

impl Strategy {
    pub const DEFAULT_CHAIN: [Strategy; 3] = [
        Strategy::EmptyReplyRecovery,
        Strategy::ConstraintFallback,
        Strategy::GenericFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyReplyRecovery => "empty_reply_recovery",
            Self::ConstraintFallback => "constraint_fallback",
            Self::GenericFallback => "generic_fallback",
        }
    }
}

/// Re-issues the turn's request with a larger output ceiling.
#[async_trait]
pub trait ReplyRetry: Send {
    async fn retry(&mut self, max_tokens: u32) -> Option<Completion>;
}

/// Retry source for paths where no second request is possible.
pub struct NoRetry;

#[async_trait]
impl ReplyRetry for NoRetry {
    async fn retry(&mut self, _max_tokens: u32) -> Option<Completion> {
        None
    }
}

/// What the pipeline produced before refinement.
#[derive(Debug, Clone)]
pub struct Draft<'a> {
    pub reply: &'a str,
    pub request_text: &'a str,
    pub constraint: Option<ReplyConstraint>,
    pub finish_reason: Option<FinishReason>,
    pub completion_tokens: u32,
    pub max_tokens: u32,
    /// Provider or loop failure. `reply` then holds only what was streamed
    /// before the failure, if anything.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Refined {
    pub reply: String,
    /// Strategy that produced `reply`; `None` when the draft passed through.
    pub strategy: Option<Strategy>,
    pub fallback_reason: Option<String>,
    /// Usage of the recovery request, if one was made.
    pub retry: Option<Completion>,
}

impl Refined {
    pub fn fallback_stage(&self) -> Option<&'static str> {
        self.strategy.map(|s| s.as_str())
    }
}

/// Runs the configured strategies in order until one yields a reply.
pub struct Refiner {
    config: RefineConfig,
    chain: Vec<Strategy>,
}

impl Refiner {
    pub fn new(config: RefineConfig) -> Self {
        Self::with_chain(config, Strategy::DEFAULT_CHAIN.to_vec())
    }

    pub fn with_chain(config: RefineConfig, chain: Vec<Strategy>) -> Self {
        Self { config, chain }
    }

    fn acceptable(reply: &str, constraint: Option<ReplyConstraint>) -> bool {
        match constraint {
            Some(c) => c.is_satisfied_by(reply),
            None => !reply.trim().is_empty(),
        }
    }

    fn token_starved(&self, draft: &Draft<'_>) -> bool {
        if draft.finish_reason == Some(FinishReason::Length) {
            return true;
        }
        draft.max_tokens > 0
            && f64::from(draft.completion_tokens)
                >= self.config.token_starved_ratio * f64::from(draft.max_tokens)
    }

    fn reason(draft: &Draft<'_>) -> String {
        if let Some(failure) = &draft.failure {
            return failure.clone();
        }
        match draft.constraint {
            Some(c) if !draft.reply.trim().is_empty() => format!("constraint_violation:{}", c.label()),
            _ => "empty_reply".to_string(),
        }
    }

    pub async fn refine(&self, draft: Draft<'_>, retry: &mut dyn ReplyRetry) -> Refined {
        if draft.failure.is_none() && Self::acceptable(draft.reply, draft.constraint) {
            return Refined {
                reply: draft.reply.to_string(),
                strategy: None,
                fallback_reason: None,
                retry: None,
            };
        }

        let reason = Self::reason(&draft);
        let mut retried = None;

        for strategy in &self.chain {
            let reply = match strategy {
                Strategy::EmptyReplyRecovery => {
                    if draft.failure.is_some() || !self.token_starved(&draft) {
                        debug!("skipping empty reply recovery");
                        continue;
                    }
                    let max_tokens = self
                        .config
                        .empty_reply_retry_max_tokens
                        .max(draft.max_tokens.saturating_mul(2));
                    let Some(completion) = retry.retry(max_tokens).await else {
                        continue;
                    };
                    let reply = completion.reply.clone();
                    retried = Some(completion);
                    if !Self::acceptable(&reply, draft.constraint) {
                        continue;
                    }
                    reply
                }
                Strategy::ConstraintFallback => match draft.constraint {
                    Some(c) => constraint_fallback(c, draft.request_text),
                    None => continue,
                },
                Strategy::GenericFallback
                    if draft.failure.is_some() && !draft.reply.trim().is_empty() =>
                {
                    format!("{}\n\n{INTERRUPTED_NOTICE}", draft.reply.trim_end())
                }
                Strategy::GenericFallback => GENERIC_FALLBACK.to_string(),
            };

            info!(stage = strategy.as_str(), reason = %reason, "reply refined");
            return Refined {
                reply,
                strategy: Some(*strategy),
                fallback_reason: Some(reason),
                retry: retried,
            };
        }

        // Only reachable with a chain that omits the generic stage.
        Refined {
            reply: GENERIC_FALLBACK.to_string(),
            strategy: Some(Strategy::GenericFallback),
            fallback_reason: Some(reason),
            retry: retried,
        }
    }
}
