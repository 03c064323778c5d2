use std::collections::VecDeque;
use std::sync::Arc;

use nova_common::{Turn, clean_text, stable_digest};
use nova_config::PromptBudgetConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::providers::{ChatMessage, ChatRole};

/// Framing cost charged per history message on top of its text.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Trimmed messages folded into the conversation summary, newest kept.
const SUMMARY_MAX_MESSAGES: usize = 8;
/// Characters kept from each trimmed message in the summary.
const SUMMARY_LINE_CHARS: usize = 160;

/// Counts tokens for budgeting. Implementations may be approximate.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Approximate estimator: one token per `chars_per_token` characters, rounded up.
///
/// This is not a tokenizer. Real token counts for English prose land close to
/// it; code and non-Latin scripts can be off by a wide margin in either direction.
#[derive(Debug, Clone, Copy)]
pub struct CharTokenEstimator {
    chars_per_token: usize,
}

impl CharTokenEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharTokenEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for CharTokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token)
    }
}

/// System prompt sections, declared in priority order (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Persona,
    Memory,
    Research,
    Preferences,
    Skills,
    Summary,
}

impl SectionKind {
    fn heading(&self) -> Option<&'static str> {
        match self {
            Self::Persona => None,
            Self::Memory => Some("Relevant memories"),
            Self::Research => Some("Web context"),
            Self::Preferences => Some("User preferences"),
            Self::Skills => Some("Skills"),
            Self::Summary => Some("Conversation so far"),
        }
    }
}

/// Material merged into the system prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub persona: String,
    pub memory: Vec<String>,
    pub research: Option<String>,
    pub preferences: Option<String>,
    pub skills: Vec<String>,
    pub summary: Option<String>,
}

impl PromptContext {
    pub fn with_persona(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            ..Self::default()
        }
    }

    fn sections(&self) -> Vec<(SectionKind, String)> {
        let bullets = |items: &[String]| {
            items
                .iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| format!("- {}", s.trim()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        vec![
            (SectionKind::Persona, self.persona.trim().to_string()),
            (SectionKind::Memory, bullets(&self.memory)),
            (SectionKind::Research, self.research.clone().unwrap_or_default()),
            (SectionKind::Preferences, self.preferences.clone().unwrap_or_default()),
            (SectionKind::Skills, bullets(&self.skills)),
            (SectionKind::Summary, self.summary.clone().unwrap_or_default()),
        ]
    }
}

/// Output of [`PromptBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    /// History that survived trimming, oldest first. Excludes the current message.
    pub history: Vec<ChatMessage>,
    pub user_message: String,
    /// Stable hex digest of the assembled prompt.
    pub prompt_hash: String,
    pub estimated_tokens: usize,
    pub dropped_sections: Vec<SectionKind>,
    pub trimmed_messages: usize,
    /// Persona or user text had to be cut to fit the ceiling.
    pub truncated: bool,
}

impl BuiltPrompt {
    /// History followed by the current user message.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(self.user_message.clone()));
        messages
    }
}

/// Assembles the system prompt and history under a hard token ceiling of
/// `max_prompt_tokens - response_reserve_tokens`.
pub struct PromptBuilder {
    budget: PromptBudgetConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl PromptBuilder {
    pub fn new(budget: PromptBudgetConfig, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { budget, estimator }
    }

    pub fn ceiling(&self) -> usize {
        self.budget
            .max_prompt_tokens
            .saturating_sub(self.budget.response_reserve_tokens)
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator.as_ref()
    }

    pub fn budget(&self) -> &PromptBudgetConfig {
        &self.budget
    }

    /// Trim order when over the ceiling: drop sections from the lowest
    /// priority up (persona is kept), trim the oldest history toward the
    /// history target without crossing the history floor, then drop further
    /// history, then cut the persona and finally the user text. Trimmed
    /// history is folded into the summary section when room is left.
    pub fn build(&self, turn: &Turn, context: &PromptContext, history: &[ChatMessage]) -> BuiltPrompt {
        let ceiling = self.ceiling();
        let mut sections: Vec<(SectionKind, String)> = context
            .sections()
            .into_iter()
            .map(|(kind, body)| (kind, self.truncate_to(&body, self.budget.section_max_tokens)))
            .filter(|(_, body)| !body.trim().is_empty())
            .collect();
        let mut history: VecDeque<ChatMessage> = history.iter().cloned().collect();
        let mut user_message = turn.cleaned_text.clone();
        let mut dropped_sections = Vec::new();
        let mut truncated = false;

        while self.total(&sections, &history, &user_message) > ceiling {
            let Some(pos) = sections.iter().rposition(|(k, _)| *k != SectionKind::Persona) else {
                break;
            };
            dropped_sections.push(sections.remove(pos).0);
        }

        let mut trimmed: Vec<ChatMessage> = Vec::new();
        if self.total(&sections, &history, &user_message) > ceiling {
            let mut history_tokens: usize = history.iter().map(|m| self.message_tokens(m)).sum();
            while history_tokens > self.budget.history_target_tokens {
                let Some(oldest) = history.front() else { break };
                let cost = self.message_tokens(oldest);
                if history_tokens - cost < self.budget.min_history_tokens {
                    break;
                }
                trimmed.extend(history.pop_front());
                history_tokens -= cost;
            }
        }

        // The floor is soft: the ceiling wins.
        while self.total(&sections, &history, &user_message) > ceiling && !history.is_empty() {
            trimmed.extend(history.pop_front());
        }
        let trimmed_messages = trimmed.len();

        if !trimmed.is_empty() {
            let previous = context.summary.as_deref();
            self.fold_trimmed_history(&mut sections, previous, &trimmed, &history, &user_message);
        }

        loop {
            let total = self.total(&sections, &history, &user_message);
            if total <= ceiling {
                break;
            }
            let over = total - ceiling;
            if let Some(persona) = sections.first_mut().filter(|(k, _)| *k == SectionKind::Persona) {
                let target = self.estimator.estimate(&persona.1).saturating_sub(over.max(1));
                persona.1 = self.truncate_to(&persona.1, target);
                truncated = true;
                if persona.1.is_empty() {
                    sections.remove(0);
                }
                continue;
            }
            if user_message.is_empty() {
                break;
            }
            let target = self.estimator.estimate(&user_message).saturating_sub(over.max(1));
            user_message = self.truncate_to(&user_message, target);
            truncated = true;
        }

        let system_prompt = render(&sections);
        let history: Vec<ChatMessage> = history.into_iter().collect();
        let estimated_tokens = self.estimator.estimate(&system_prompt)
            + history.iter().map(|m| self.message_tokens(m)).sum::<usize>()
            + self.estimator.estimate(&user_message);
        let prompt_hash = hash_prompt(&system_prompt, &history, &user_message);

        if !dropped_sections.is_empty() || trimmed_messages > 0 || truncated {
            debug!(
                ?dropped_sections,
                trimmed_messages, truncated, estimated_tokens, ceiling, "prompt trimmed to budget"
            );
        }

        BuiltPrompt {
            system_prompt,
            history,
            user_message,
            prompt_hash,
            estimated_tokens,
            dropped_sections,
            trimmed_messages,
            truncated,
        }
    }

    /// Replace the summary section with one that also covers the trimmed
    /// messages, sized to whatever room is left under the ceiling.
    fn fold_trimmed_history(
        &self,
        sections: &mut Vec<(SectionKind, String)>,
        previous: Option<&str>,
        trimmed: &[ChatMessage],
        history: &VecDeque<ChatMessage>,
        user_message: &str,
    ) {
        sections.retain(|(kind, _)| *kind != SectionKind::Summary);
        let used = self.total(sections, history, user_message);
        let heading_cost = self
            .estimator
            .estimate(&format!("\n\n## {}\n", SectionKind::Summary.heading().unwrap_or_default()));
        let room = self
            .ceiling()
            .saturating_sub(used)
            .saturating_sub(heading_cost + 1)
            .min(self.budget.section_max_tokens);
        if room == 0 {
            return;
        }

        let mut keep = trimmed.len().min(SUMMARY_MAX_MESSAGES);
        let body = loop {
            let candidate = summarize_trimmed(previous, &trimmed[trimmed.len() - keep..]);
            if keep <= 1 || self.estimator.estimate(&candidate) <= room {
                break self.truncate_to(&candidate, room);
            }
            keep -= 1;
        };
        if body.trim().is_empty() {
            return;
        }
        sections.push((SectionKind::Summary, body));
        if self.total(sections, history, user_message) > self.ceiling() {
            sections.pop();
        }
    }

    fn message_tokens(&self, message: &ChatMessage) -> usize {
        self.estimator.estimate(&message.flat_text()) + MESSAGE_OVERHEAD_TOKENS
    }

    fn total(
        &self,
        sections: &[(SectionKind, String)],
        history: &VecDeque<ChatMessage>,
        user_message: &str,
    ) -> usize {
        self.estimator.estimate(&render(sections))
            + history.iter().map(|m| self.message_tokens(m)).sum::<usize>()
            + self.estimator.estimate(user_message)
    }

    /// Longest prefix of `text` estimated at or under `max_tokens`.
    fn truncate_to(&self, text: &str, max_tokens: usize) -> String {
        if self.estimator.estimate(text) <= max_tokens {
            return text.to_string();
        }
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if self.estimator.estimate(&text[..boundaries[mid]]) <= max_tokens {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..boundaries[lo]].trim_end().to_string()
    }
}

/// Extractive summary: the earlier summary followed by one clipped line per
/// trimmed message.
fn summarize_trimmed(previous: Option<&str>, trimmed: &[ChatMessage]) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(previous) = previous.map(str::trim).filter(|p| !p.is_empty()) {
        lines.push(previous.to_string());
    }
    for message in trimmed {
        let role = match message.role {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
            ChatRole::System | ChatRole::Tool => continue,
        };
        let text = clean_text(&message.flat_text());
        if text.is_empty() {
            continue;
        }
        let clipped: String = text.chars().take(SUMMARY_LINE_CHARS).collect();
        let ellipsis = if clipped.len() < text.len() { "..." } else { "" };
        lines.push(format!("{role}: {clipped}{ellipsis}"));
    }
    lines.join("\n")
}

fn render(sections: &[(SectionKind, String)]) -> String {
    sections
        .iter()
        .map(|(kind, body)| match kind.heading() {
            Some(heading) => format!("## {heading}\n{body}"),
            None => body.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn hash_prompt(system: &str, history: &[ChatMessage], user_message: &str) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(history.len() + 2);
    parts.push(system.to_string());
    for message in history {
        let role = match message.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        parts.push(format!("{role}:{}", message.flat_text()));
    }
    parts.push(format!("user:{user_message}"));
    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    stable_digest(&refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_common::InboundTurn;

    fn turn(text: &str) -> Turn {
        Turn::receive_at(InboundTurn::text("u", "c", "s", text), 0, 2_000)
    }

    fn builder(max: usize, reserve: usize, section: usize, target: usize, floor: usize) -> PromptBuilder {
        PromptBuilder::new(
            PromptBudgetConfig {
                max_prompt_tokens: max,
                response_reserve_tokens: reserve,
                section_max_tokens: section,
                history_target_tokens: target,
                min_history_tokens: floor,
            },
            Arc::new(CharTokenEstimator::default()),
        )
    }

    fn history(n: usize, chars: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let text = format!("{i:04}{}", "x".repeat(chars.saturating_sub(4)));
                if i % 2 == 0 {
                    ChatMessage::user(text)
                } else {
                    ChatMessage::assistant(text)
                }
            })
            .collect()
    }

    #[test]
    fn char_estimator_rounds_up() {
        let est = CharTokenEstimator::default();
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("abc"), 1);
        assert_eq!(est.estimate("abcde"), 2);
        assert_eq!(est.estimate("héllo wörld"), 3);
    }

    #[test]
    fn under_budget_keeps_everything() {
        let b = builder(12_000, 2_000, 1_200, 6_000, 600);
        let ctx = PromptContext {
            memory: vec!["lives in Lisbon".into()],
            ..PromptContext::with_persona("You are Nova.")
        };
        let built = b.build(&turn("hi"), &ctx, &history(4, 40));
        assert!(built.dropped_sections.is_empty());
        assert_eq!(built.history.len(), 4);
        assert!(built.system_prompt.starts_with("You are Nova."));
        assert!(built.system_prompt.contains("## Relevant memories\n- lives in Lisbon"));
    }

    #[test]
    fn sections_are_capped_individually() {
        let b = builder(12_000, 2_000, 10, 6_000, 600);
        let ctx = PromptContext {
            summary: Some("s".repeat(400)),
            ..PromptContext::with_persona("p".repeat(400))
        };
        let built = b.build(&turn("hi"), &ctx, &[]);
        for part in built.system_prompt.split("\n\n") {
            let body = part.trim_start_matches("## Conversation so far\n");
            assert!(CharTokenEstimator::default().estimate(body) <= 10);
        }
    }

    #[test]
    fn lowest_priority_sections_drop_first() {
        let b = builder(120, 40, 30, 1_000, 0);
        let ctx = PromptContext {
            memory: vec!["m".repeat(100)],
            skills: vec!["k".repeat(100)],
            summary: Some("s".repeat(100)),
            ..PromptContext::with_persona("p".repeat(100))
        };
        let built = b.build(&turn("hello"), &ctx, &[]);
        assert_eq!(
            built.dropped_sections,
            vec![SectionKind::Summary, SectionKind::Skills]
        );
        assert!(built.system_prompt.contains("Relevant memories"));
        assert!(built.estimated_tokens <= b.ceiling());
    }

    #[test]
    fn history_trims_oldest_first_toward_target() {
        // Each message costs 25 + 4 tokens.
        let b = builder(400, 100, 100, 120, 60);
        let built = b.build(&turn("q"), &PromptContext::with_persona("p"), &history(20, 100));
        assert_eq!(built.trimmed_messages, 16);
        assert!(built.history.first().unwrap().flat_text().starts_with("0016"));
        assert_eq!(
            built.history.last().unwrap().flat_text(),
            history(20, 100)[19].flat_text()
        );
        assert!(built.estimated_tokens <= b.ceiling());
    }

    #[test]
    fn trimmed_history_is_folded_into_summary() {
        let b = builder(400, 100, 100, 120, 60);
        let ctx = PromptContext {
            summary: Some("Planning a trip to Japan.".into()),
            ..PromptContext::with_persona("p")
        };
        let built = b.build(&turn("q"), &ctx, &history(20, 100));
        assert_eq!(built.trimmed_messages, 16);
        let summary = built
            .system_prompt
            .split("## Conversation so far\n")
            .nth(1)
            .expect("summary section present");
        assert!(summary.starts_with("Planning a trip to Japan."));
        assert!(summary.contains("Assistant: 0015"));
        assert!(!summary.contains("0002"));
        assert!(built.estimated_tokens <= b.ceiling());
    }

    #[test]
    fn untrimmed_history_adds_no_summary() {
        let b = builder(12_000, 2_000, 1_200, 6_000, 600);
        let built = b.build(&turn("hi"), &PromptContext::with_persona("p"), &history(4, 40));
        assert!(!built.system_prompt.contains("Conversation so far"));
    }

    #[test]
    fn ceiling_holds_for_arbitrary_history() {
        let b = builder(1_000, 200, 150, 500, 300);
        let ctx = PromptContext {
            memory: vec!["x".repeat(2_000)],
            preferences: Some("y".repeat(2_000)),
            ..PromptContext::with_persona("z".repeat(2_000))
        };
        for n in [0, 1, 10, 500] {
            let built = b.build(&turn(&"w".repeat(5_000)), &ctx, &history(n, 333));
            assert!(built.estimated_tokens <= b.ceiling(), "n={n}: {}", built.estimated_tokens);
        }
    }

    #[test]
    fn degenerate_ceiling_empties_prompt() {
        let b = builder(10, 10, 100, 100, 100);
        let built = b.build(&turn("hello world"), &PromptContext::with_persona("persona"), &history(3, 10));
        assert_eq!(built.estimated_tokens, 0);
        assert!(built.truncated);
    }

    #[test]
    fn prompt_hash_is_stable_and_content_sensitive() {
        let b = builder(12_000, 2_000, 1_200, 6_000, 600);
        let ctx = PromptContext::with_persona("You are Nova.");
        let a = b.build(&turn("hi"), &ctx, &history(2, 20));
        let again = b.build(&turn("hi"), &ctx, &history(2, 20));
        let other = b.build(&turn("hey"), &ctx, &history(2, 20));
        assert_eq!(a.prompt_hash, again.prompt_hash);
        assert_ne!(a.prompt_hash, other.prompt_hash);
    }
}
