//! Cheap deterministic replies tried before any LLM call.
//!
//! Classifiers are pure text matchers. Resolving a match may call one tool
//! (`weather_lookup`, `crypto_portfolio`); if that call fails for any reason
//! the fast path yields nothing and the turn continues down the full path.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use nova_common::Turn;
use nova_config::FastPathConfig;

use crate::tools::{ToolContext, ToolRegistry};

pub const WEATHER_TOOL: &str = "weather_lookup";
pub const CRYPTO_TOOL: &str = "crypto_portfolio";

const WEATHER_CLARIFY: &str = "Which city should I check the weather for?";
/// A pending clarification is only consumed by a reply shaped like a place name.
const MAX_LOCATION_WORDS: usize = 4;
/// Sweep expired clarifications once this many sessions are waiting.
const PENDING_PRUNE_THRESHOLD: usize = 256;

/// Explicit weather requests only. Words like "temperature" or "rain" on
/// their own appear in plenty of questions that have nothing to do with it.
static WEATHER_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:weather|forecast)\b|\b(?:will|is|does|gonna)\s+it\s+(?:be\s+)?(?:rain(?:ing|y)?|snow(?:ing|y)?|sunny|windy|stormy|hot|cold|freezing)\b|\bhow\s+(?:hot|cold|warm)\s+is\s+it\s+(?:in|outside)\b",
    )
    .expect("weather trigger regex should compile")
});

static WEATHER_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:in|for|at|near)\s+([a-z][a-z .'\-]{1,60}?)\s*(?:\b(?:today|tomorrow|tonight|right now|now|this week|this weekend|later)\b|[?.!,]|$)",
    )
    .expect("weather location regex should compile")
});

static CRYPTO_TRIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(crypto|portfolio|holdings|coinbase)\b")
        .expect("crypto trigger regex should compile")
});

static CRYPTO_PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(price|worth|value|trading|doing)\b")
        .expect("crypto price regex should compile")
});

static CRYPTO_ASSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bitcoin|btc|ethereum|eth|solana|sol|dogecoin|doge)\b")
        .expect("crypto asset regex should compile")
});

static LOCATION_SHAPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:in\s+)?([a-z][a-z .'\-]*)$").expect("location regex should compile")
});

const NOT_A_PLACE: &[&str] = &[
    "today", "tomorrow", "tonight", "now", "the week", "this week", "the weekend", "me", "us",
    "here", "later",
];

/// Words that mark a follow-up as conversation rather than a place name.
const NOT_A_PLACE_WORD: &[&str] = &[
    "thanks", "thank", "thx", "ty", "ok", "okay", "k", "no", "nope", "nah", "yes", "yeah", "yep",
    "sure", "cool", "great", "fine", "whatever", "nevermind", "never", "mind", "cancel", "stop",
    "hi", "hey", "hello", "bye", "lol", "please", "what", "why", "how", "who", "when", "i", "you",
    "it", "that", "this", "me", "here", "now", "today", "tomorrow",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FastPathKind {
    Weather,
    Crypto,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathIntent {
    Weather { location: Option<String> },
    Crypto { assets: Vec<String> },
}

impl FastPathIntent {
    pub fn kind(&self) -> FastPathKind {
        match self {
            Self::Weather { .. } => FastPathKind::Weather,
            Self::Crypto { .. } => FastPathKind::Crypto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathResult {
    Reply { kind: FastPathKind, text: String },
    Clarify { kind: FastPathKind, question: String },
}

impl FastPathResult {
    pub fn text(&self) -> &str {
        match self {
            Self::Reply { text, .. } => text,
            Self::Clarify { question, .. } => question,
        }
    }

    pub fn kind(&self) -> FastPathKind {
        match self {
            Self::Reply { kind, .. } | Self::Clarify { kind, .. } => *kind,
        }
    }
}

/// Weather intent, with the location if one was named.
pub fn detect_weather(text: &str) -> Option<Option<String>> {
    if !WEATHER_TRIGGER.is_match(text) {
        return None;
    }
    let location = WEATHER_LOCATION
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().trim_end_matches(['.', '?', '!', ',']).to_string())
        .filter(|loc| !loc.is_empty() && !NOT_A_PLACE.contains(&loc.to_lowercase().as_str()));
    Some(location)
}

/// The place named by a reply to a weather clarification, if it reads like one.
pub fn location_from_follow_up(text: &str) -> Option<String> {
    let trimmed = text.trim().trim_end_matches(['.', '!']).trim();
    let location = LOCATION_SHAPED.captures(trimmed)?.get(1)?.as_str().trim();
    let words: Vec<String> = location.split_whitespace().map(str::to_lowercase).collect();
    if words.is_empty() || words.len() > MAX_LOCATION_WORDS {
        return None;
    }
    if words.iter().any(|w| NOT_A_PLACE_WORD.contains(&w.as_str())) {
        return None;
    }
    Some(location.to_string())
}

/// Crypto intent with the tickers mentioned (empty means the whole portfolio).
pub fn detect_crypto(text: &str) -> Option<Vec<String>> {
    let mut assets: Vec<String> = Vec::new();
    for m in CRYPTO_ASSET.find_iter(text) {
        let symbol = match m.as_str().to_lowercase().as_str() {
            "bitcoin" | "btc" => "BTC",
            "ethereum" | "eth" => "ETH",
            "solana" | "sol" => "SOL",
            _ => "DOGE",
        }
        .to_string();
        if !assets.contains(&symbol) {
            assets.push(symbol);
        }
    }
    let triggered = CRYPTO_TRIGGER.is_match(text) || (!assets.is_empty() && CRYPTO_PRICE.is_match(text));
    triggered.then_some(assets)
}

/// All matching intents in precedence order: weather before crypto.
pub fn classify_intents(text: &str) -> Vec<FastPathIntent> {
    let mut intents = Vec::new();
    if let Some(location) = detect_weather(text) {
        intents.push(FastPathIntent::Weather { location });
    }
    if let Some(assets) = detect_crypto(text) {
        intents.push(FastPathIntent::Crypto { assets });
    }
    intents
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    kind: FastPathKind,
    expires_at_ms: i64,
}

/// Runs the classifiers and owns the per-session clarification state.
pub struct FastPathRouter {
    weather_enabled: bool,
    crypto_enabled: bool,
    confirmation_ttl_ms: i64,
    pending: DashMap<String, PendingConfirmation>,
}

impl FastPathRouter {
    pub fn new(config: &FastPathConfig) -> Self {
        Self {
            weather_enabled: config.weather,
            crypto_enabled: config.crypto,
            confirmation_ttl_ms: (config.confirmation_ttl_secs as i64).saturating_mul(1_000),
            pending: DashMap::new(),
        }
    }

    pub fn has_pending(&self, session_key: &str) -> bool {
        self.pending.contains_key(session_key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Forget clarifications whose session never came back.
    pub fn prune_at(&self, now_ms: i64) {
        self.pending.retain(|_, p| p.expires_at_ms > now_ms);
    }

    pub async fn classify(
        &self,
        turn: &Turn,
        tools: &ToolRegistry,
        timeout: Duration,
    ) -> Option<FastPathResult> {
        self.classify_at(turn, tools, timeout, Utc::now().timestamp_millis())
            .await
    }

    pub async fn classify_at(
        &self,
        turn: &Turn,
        tools: &ToolRegistry,
        timeout: Duration,
        now_ms: i64,
    ) -> Option<FastPathResult> {
        let text = turn.cleaned_text.as_str();
        let context = ToolContext::for_turn(turn);

        if let Some((_, pending)) = self.pending.remove(turn.session_key.as_str())
            && pending.expires_at_ms > now_ms
            && pending.kind == FastPathKind::Weather
        {
            match location_from_follow_up(text) {
                Some(location) => {
                    debug!(session = %turn.session_key, %location, "resolving pending weather clarification");
                    if let Some(result) = self.resolve_weather(&location, tools, &context, timeout).await {
                        return Some(result);
                    }
                }
                None => debug!(session = %turn.session_key, "follow-up is not a place; clarification dropped"),
            }
        }

        for intent in classify_intents(text) {
            let result = match intent {
                FastPathIntent::Weather { .. } if !self.weather_enabled => continue,
                FastPathIntent::Crypto { .. } if !self.crypto_enabled => continue,
                FastPathIntent::Weather { location: None } => {
                    if !tools.contains(WEATHER_TOOL) {
                        continue;
                    }
                    if self.pending.len() > PENDING_PRUNE_THRESHOLD {
                        self.prune_at(now_ms);
                    }
                    self.pending.insert(
                        turn.session_key.as_str().to_string(),
                        PendingConfirmation {
                            kind: FastPathKind::Weather,
                            expires_at_ms: now_ms + self.confirmation_ttl_ms,
                        },
                    );
                    Some(FastPathResult::Clarify {
                        kind: FastPathKind::Weather,
                        question: WEATHER_CLARIFY.to_string(),
                    })
                }
                FastPathIntent::Weather {
                    location: Some(location),
                } => self.resolve_weather(&location, tools, &context, timeout).await,
                FastPathIntent::Crypto { assets } => {
                    run_tool(tools, CRYPTO_TOOL, json!({ "assets": assets }), &context, timeout)
                        .await
                        .map(|text| FastPathResult::Reply {
                            kind: FastPathKind::Crypto,
                            text,
                        })
                }
            };
            if let Some(result) = result {
                info!(kind = ?result.kind(), turn_id = %turn.turn_id, "fast path answered turn");
                return Some(result);
            }
        }
        None
    }

    async fn resolve_weather(
        &self,
        location: &str,
        tools: &ToolRegistry,
        context: &ToolContext,
        timeout: Duration,
    ) -> Option<FastPathResult> {
        if location.is_empty() {
            return None;
        }
        run_tool(tools, WEATHER_TOOL, json!({ "location": location }), context, timeout)
            .await
            .map(|text| FastPathResult::Reply {
                kind: FastPathKind::Weather,
                text,
            })
    }
}

/// Tool text on success, `None` on any failure.
async fn run_tool(
    tools: &ToolRegistry,
    name: &str,
    input: serde_json::Value,
    context: &ToolContext,
    timeout: Duration,
) -> Option<String> {
    if !tools.contains(name) {
        return None;
    }
    let invocation = tools.execute(name, context, input, timeout).await;
    if invocation.output.is_error {
        debug!(tool = name, error = %invocation.output.content, "fast path tool failed; falling through");
        return None;
    }
    let text = invocation.output.content.trim().to_string();
    (!text.is_empty()).then_some(text)
}
