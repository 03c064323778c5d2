use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, SessionKey, UserContextId};

/// Surface a turn arrived from. Only affects delivery side-channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Hud,
    Voice,
    Mission,
    #[default]
    Api,
}

/// Caller-supplied hints consulted when computing the execution policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnHints {
    pub stream: Option<bool>,
    pub tool_loop: Option<bool>,
    pub web_search: Option<bool>,
    pub memory_recall: Option<bool>,
    pub fast_lane: Option<bool>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Inbound turn submission as received from a surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTurn {
    pub text: String,
    pub user_context_id: UserContextId,
    pub conversation_id: ConversationId,
    pub session_key: SessionKey,
    #[serde(default)]
    pub source: TurnSource,
    #[serde(default)]
    pub hints: TurnHints,
}

impl InboundTurn {
    pub fn text(
        user_context_id: impl Into<UserContextId>,
        conversation_id: impl Into<ConversationId>,
        session_key: impl Into<SessionKey>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            user_context_id: user_context_id.into(),
            conversation_id: conversation_id.into(),
            session_key: session_key.into(),
            source: TurnSource::default(),
            hints: TurnHints::default(),
        }
    }

    pub fn with_hints(mut self, hints: TurnHints) -> Self {
        self.hints = hints;
        self
    }
}

/// One inbound user message being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub user_context_id: UserContextId,
    pub conversation_id: ConversationId,
    pub session_key: SessionKey,
    pub raw_text: String,
    pub cleaned_text: String,
    pub received_at_ms: i64,
    pub source: TurnSource,
    pub hints: TurnHints,
}

impl Turn {
    /// Stamp an inbound submission with the current time.
    pub fn receive(inbound: InboundTurn, bucket_ms: i64) -> Self {
        Self::receive_at(inbound, Utc::now().timestamp_millis(), bucket_ms)
    }

    /// Build a turn with an explicit receipt time. `turn_id` is stable for
    /// identical text in the same session within one `bucket_ms` window.
    pub fn receive_at(inbound: InboundTurn, received_at_ms: i64, bucket_ms: i64) -> Self {
        let cleaned_text = clean_text(&inbound.text);
        let bucket = received_at_ms / bucket_ms.max(1);
        let turn_id = stable_digest(&[
            inbound.session_key.as_str(),
            &cleaned_text.to_lowercase(),
            &bucket.to_string(),
        ]);
        Self {
            turn_id,
            user_context_id: inbound.user_context_id,
            conversation_id: inbound.conversation_id,
            session_key: inbound.session_key,
            raw_text: inbound.text,
            cleaned_text,
            received_at_ms,
            source: inbound.source,
            hints: inbound.hints,
        }
    }
}

/// Collapse runs of whitespace and trim the ends.
pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 over the parts, separated so `["ab","c"]` != `["a","bc"]`.
pub fn stable_digest(parts: &[&str]) -> String {
    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    for part in parts {
        ctx.update(part.as_bytes());
        ctx.update(&[0x1f]);
    }
    ctx.finish()
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_at_cleans_text_and_derives_id() {
        let inbound = InboundTurn::text("user-1", "conv-1", "sess-1", "  hello \n  world ");
        let turn = Turn::receive_at(inbound, 10_000, 2_000);

        assert_eq!(turn.cleaned_text, "hello world");
        assert_eq!(turn.raw_text, "  hello \n  world ");
        assert_eq!(turn.received_at_ms, 10_000);
        assert_eq!(turn.turn_id.len(), 64);
    }

    #[test]
    fn turn_id_is_stable_within_bucket() {
        let a = Turn::receive_at(InboundTurn::text("u", "c", "s", "Hi"), 10_000, 2_000);
        let b = Turn::receive_at(InboundTurn::text("u", "c", "s", "hi "), 11_999, 2_000);
        let c = Turn::receive_at(InboundTurn::text("u", "c", "s", "hi"), 12_000, 2_000);

        assert_eq!(a.turn_id, b.turn_id);
        assert_ne!(a.turn_id, c.turn_id);
    }

    #[test]
    fn digest_separates_parts() {
        assert_ne!(stable_digest(&["ab", "c"]), stable_digest(&["a", "bc"]));
    }

    #[test]
    fn inbound_deserializes_with_defaults() {
        let inbound: InboundTurn = serde_json::from_value(serde_json::json!({
            "text": "hello",
            "user_context_id": "u",
            "conversation_id": "c",
            "session_key": "s"
        }))
        .unwrap();
        assert_eq!(inbound.source, TurnSource::Api);
        assert_eq!(inbound.hints, TurnHints::default());
    }
}
