use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use nova_common::Turn;

/// Output token ceiling applied in the fast lane.
pub const FAST_LANE_MAX_TOKENS: u32 = 512;

static SMALL_TALK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(hi|hey|hello|yo|thanks|thank you|thx|ok|okay|cool|nice|good (morning|night|evening|afternoon)|bye|goodbye|how are you)[\s!.?]*$",
    )
    .expect("small talk regex should compile")
});

static TOOL_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(search|look up|lookup|find|latest|news|today|current|schedule|remind|send|deliver|report|check|weather|price|portfolio|email|calendar|open|read|write|download)\b",
    )
    .expect("tool intent regex should compile")
});

static WEB_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(latest|news|today|this week|current(ly)?|search( the web)?|look up|who won|price of|headlines)\b")
        .expect("web intent regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyLane {
    Fast,
    Default,
}

/// Per-turn routing decisions. Computed once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub tool_loop: bool,
    pub web_search_preload: bool,
    pub memory_recall: bool,
    pub stream: bool,
    pub lane: LatencyLane,
}

/// Process-wide inputs to [`ExecutionPolicy::compute`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyDefaults {
    pub tool_loop_enabled: bool,
    pub stream_by_default: bool,
    pub has_tools: bool,
    pub has_web_search: bool,
}

impl ExecutionPolicy {
    /// Keyword heuristics over the turn text, overridden by caller hints.
    pub fn compute(turn: &Turn, defaults: PolicyDefaults) -> Self {
        let text = turn.cleaned_text.as_str();
        let hints = &turn.hints;
        let small_talk = is_small_talk(text);
        let tool_intent = TOOL_INTENT.is_match(text);

        // Registered tools alone are not a reason to loop; the text has to ask for one.
        let tool_loop = defaults.tool_loop_enabled
            && defaults.has_tools
            && hints.tool_loop.unwrap_or(!small_talk && tool_intent);

        let web_search_preload = defaults.has_web_search
            && hints.web_search.unwrap_or(!small_talk && WEB_INTENT.is_match(text));

        let lane = match hints.fast_lane {
            Some(true) => LatencyLane::Fast,
            Some(false) => LatencyLane::Default,
            None if small_talk => LatencyLane::Fast,
            None if !tool_intent && text.split_whitespace().count() <= 4 => LatencyLane::Fast,
            None => LatencyLane::Default,
        };

        let memory_recall = hints
            .memory_recall
            .unwrap_or(!small_talk && lane == LatencyLane::Default);

        Self {
            tool_loop,
            web_search_preload,
            memory_recall,
            stream: hints.stream.unwrap_or(defaults.stream_by_default),
            lane,
        }
    }

    /// Clamp the configured output ceiling for the chosen lane.
    pub fn max_tokens(&self, configured: u32) -> u32 {
        match self.lane {
            LatencyLane::Fast => configured.min(FAST_LANE_MAX_TOKENS),
            LatencyLane::Default => configured,
        }
    }
}

pub fn is_small_talk(text: &str) -> bool {
    SMALL_TALK.is_match(text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_common::{InboundTurn, TurnHints};

    fn turn(text: &str, hints: TurnHints) -> Turn {
        Turn::receive_at(InboundTurn::text("u", "c", "s", text).with_hints(hints), 0, 2_000)
    }

    fn defaults() -> PolicyDefaults {
        PolicyDefaults {
            tool_loop_enabled: true,
            stream_by_default: false,
            has_tools: true,
            has_web_search: true,
        }
    }

    #[test]
    fn small_talk_takes_fast_lane_without_tools() {
        let policy = ExecutionPolicy::compute(&turn("hey!", TurnHints::default()), defaults());
        assert_eq!(policy.lane, LatencyLane::Fast);
        assert!(!policy.tool_loop);
        assert!(!policy.memory_recall);
        assert!(!policy.web_search_preload);
    }

    #[test]
    fn news_question_preloads_search_and_runs_loop() {
        let policy = ExecutionPolicy::compute(
            &turn("what are the latest headlines about the election", TurnHints::default()),
            defaults(),
        );
        assert!(policy.tool_loop);
        assert!(policy.web_search_preload);
        assert!(policy.memory_recall);
        assert_eq!(policy.lane, LatencyLane::Default);
    }

    #[test]
    fn hints_override_heuristics() {
        let hints = TurnHints {
            tool_loop: Some(false),
            fast_lane: Some(true),
            stream: Some(true),
            memory_recall: Some(true),
            ..TurnHints::default()
        };
        let policy = ExecutionPolicy::compute(
            &turn("search the web for rust release notes", hints),
            defaults(),
        );
        assert!(!policy.tool_loop);
        assert!(policy.stream);
        assert!(policy.memory_recall);
        assert_eq!(policy.lane, LatencyLane::Fast);
        assert_eq!(policy.max_tokens(1024), FAST_LANE_MAX_TOKENS);
    }

    #[test]
    fn plain_question_streams_even_with_tools_registered() {
        let hints = TurnHints {
            stream: Some(true),
            ..TurnHints::default()
        };
        let policy = ExecutionPolicy::compute(&turn("tell me about otters", hints), defaults());
        assert!(!policy.tool_loop);
        assert!(policy.stream);
    }

    #[test]
    fn no_tools_means_no_loop_even_when_hinted() {
        let hints = TurnHints {
            tool_loop: Some(true),
            ..TurnHints::default()
        };
        let policy = ExecutionPolicy::compute(
            &turn("find my files", hints),
            PolicyDefaults {
                has_tools: false,
                ..defaults()
            },
        );
        assert!(!policy.tool_loop);
    }
}
