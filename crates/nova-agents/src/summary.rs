use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::tool_loop::ToolCallRecord;

/// Which path produced the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    FastPathWeather,
    FastPathCrypto,
    FastPathClarify,
    Direct,
    Streaming,
    ToolLoop,
}

impl Route {
    pub fn is_fast_path(&self) -> bool {
        matches!(
            self,
            Self::FastPathWeather | Self::FastPathCrypto | Self::FastPathClarify
        )
    }
}

/// Wall-clock milliseconds spent in each pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLatency {
    pub stages: BTreeMap<String, u64>,
    pub total_ms: u64,
}

impl StageLatency {
    pub fn record(&mut self, stage: &str, started: Instant) {
        let ms = started.elapsed().as_millis() as u64;
        *self.stages.entry(stage.to_string()).or_default() += ms;
    }

    pub fn get(&self, stage: &str) -> Option<u64> {
        self.stages.get(stage).copied()
    }
}

/// Per-turn record returned to callers and logged at the end of every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// A non-empty reply was produced. Starts `false` and is set once the
    /// reply is final. Degraded paths still count; see `fallback_stage` and
    /// `fallback_reason` for how the reply was obtained.
    pub ok: bool,
    pub turn_id: String,
    pub reply: String,
    pub route: Route,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Provider fallbacks plus recovery re-requests.
    pub retries: usize,
    pub fallback_stage: Option<String>,
    pub fallback_reason: Option<String>,
    pub prompt_hash: Option<String>,
    pub latency: StageLatency,
}

impl RunSummary {
    pub(crate) fn new(turn_id: &str, route: Route) -> Self {
        Self {
            ok: false,
            turn_id: turn_id.to_string(),
            reply: String::new(),
            route,
            provider: None,
            model: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            tool_calls: Vec::new(),
            retries: 0,
            fallback_stage: None,
            fallback_reason: None,
            prompt_hash: None,
            latency: StageLatency::default(),
        }
    }
}

/// Result of [`crate::TurnPipeline::process_turn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    Replied(RunSummary),
    /// Same text in the same session inside the debounce window. Nothing ran.
    Duplicate {
        turn_id: String,
        signature: String,
        first_seen_ms: i64,
    },
}

impl TurnOutcome {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Replied(summary) => Some(summary),
            Self::Duplicate { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_not_ok_before_a_reply_exists() {
        let summary = RunSummary::new("turn-1", Route::Direct);
        assert!(!summary.ok);
        assert!(summary.reply.is_empty());
    }
}
