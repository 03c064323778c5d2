use std::time::{Duration, Instant};

use nova_common::{ProviderError, ProviderErrorCode};
use nova_config::ToolLoopConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::completion::ProviderChain;
use crate::ledger::ScopeLocks;
use crate::providers::{
    ChatMessage, ChatRole, ContentBlock, FinishReason, LlmRequest, MessagePart, Usage,
};
use crate::tools::{ToolContext, ToolRegistry};

const FINALIZE_INSTRUCTION: &str = "Tool budget reached. Answer the user now using only the \
     information gathered so far. Do not call any more tools.";

/// Limits for one tool-loop run.
#[derive(Debug, Clone, Copy)]
pub struct ToolLoopBudget {
    /// Maximum number of `Requesting` cycles.
    pub max_steps: usize,
    /// Wall-clock budget, checked between steps.
    pub max_duration: Duration,
    pub max_tool_calls_per_step: usize,
    pub tool_exec_timeout: Duration,
}

impl From<&ToolLoopConfig> for ToolLoopBudget {
    fn from(config: &ToolLoopConfig) -> Self {
        Self {
            max_steps: config.max_steps.max(1),
            max_duration: Duration::from_millis(config.max_duration_ms),
            max_tool_calls_per_step: config.max_tool_calls_per_step.max(1),
            tool_exec_timeout: Duration::from_millis(config.tool_exec_timeout_ms),
        }
    }
}

/// Decides when repeated slowness means the backend itself is unresponsive.
#[derive(Debug, Clone)]
pub struct TimeoutHeuristic {
    markers: Vec<String>,
    abort_after: usize,
}

impl TimeoutHeuristic {
    pub fn new(markers: Vec<String>, abort_after: usize) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
            abort_after,
        }
    }

    pub fn from_config(config: &ToolLoopConfig) -> Self {
        Self::new(config.timeout_markers.clone(), config.abort_after_timeouts)
    }

    pub fn is_likely_timeout(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.markers.iter().any(|m| lower.contains(m.as_str()))
    }

    pub fn is_provider_timeout(&self, err: &ProviderError) -> bool {
        err.code == ProviderErrorCode::Timeout || self.is_likely_timeout(&err.message)
    }

    /// `true` once `consecutive` timed-out steps should end the loop.
    pub fn should_abort(&self, consecutive: usize) -> bool {
        self.abort_after > 0 && consecutive >= self.abort_after
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Requesting,
    ExecutingTools,
    Finalizing,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    Steps,
    Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub is_error: bool,
    pub timed_out: bool,
    /// Over the per-step cap and never executed.
    pub skipped: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// Final model text. Empty when the loop aborted.
    pub reply: String,
    pub state: LoopState,
    pub transitions: Vec<LoopState>,
    pub steps: usize,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub model: Option<String>,
    pub budget_exhausted: Option<BudgetLimit>,
    pub abort_reason: Option<String>,
    pub provider_error: Option<ProviderError>,
}

impl ToolLoopOutcome {
    pub fn is_aborted(&self) -> bool {
        self.state == LoopState::Aborted
    }
}

/// Bounded request / execute / re-request state machine.
pub struct ToolLoop {
    budget: ToolLoopBudget,
    heuristic: TimeoutHeuristic,
}

struct PendingCall {
    id: String,
    name: String,
    input: serde_json::Value,
}

impl ToolLoop {
    pub fn new(budget: ToolLoopBudget, heuristic: TimeoutHeuristic) -> Self {
        Self { budget, heuristic }
    }

    pub fn budget(&self) -> &ToolLoopBudget {
        &self.budget
    }

    pub async fn run(
        &self,
        chain: &mut ProviderChain,
        tools: &ToolRegistry,
        locks: &ScopeLocks,
        context: &ToolContext,
        base: LlmRequest,
    ) -> ToolLoopOutcome {
        let started = Instant::now();
        let mut request = LlmRequest {
            tools: tools.definitions(),
            ..base
        };

        let mut out = ToolLoopOutcome {
            reply: String::new(),
            state: LoopState::Requesting,
            transitions: vec![LoopState::Requesting],
            steps: 0,
            tool_calls: Vec::new(),
            usage: Usage::default(),
            finish_reason: FinishReason::Unknown,
            model: None,
            budget_exhausted: None,
            abort_reason: None,
            provider_error: None,
        };
        let mut pending: Vec<PendingCall> = Vec::new();
        let mut consecutive_timeouts = 0usize;

        loop {
            let state = out.state;
            let next = match state {
                LoopState::Requesting => {
                    if out.steps >= self.budget.max_steps {
                        out.budget_exhausted = Some(BudgetLimit::Steps);
                        LoopState::Finalizing
                    } else if out.steps > 0 && started.elapsed() >= self.budget.max_duration {
                        out.budget_exhausted = Some(BudgetLimit::Duration);
                        LoopState::Finalizing
                    } else {
                        out.steps += 1;
                        match chain.complete(&request).await {
                            Ok(response) => {
                                accumulate(&mut out.usage, response.usage);
                                out.model = Some(response.model.clone());
                                if response.has_tool_use() {
                                    pending = tool_calls(&response.content);
                                    request.messages.push(ChatMessage {
                                        role: ChatRole::Assistant,
                                        content: MessagePart::Parts(response.content),
                                    });
                                    LoopState::ExecutingTools
                                } else {
                                    out.reply = response.text();
                                    out.finish_reason = response.finish_reason();
                                    LoopState::Finalizing
                                }
                            }
                            Err(err) => self.abort_on_provider_error(&mut out, err),
                        }
                    }
                }
                LoopState::ExecutingTools => {
                    let calls = std::mem::take(&mut pending);
                    let timed_out = self
                        .execute_step(calls, tools, locks, context, &mut request.messages, &mut out)
                        .await;
                    consecutive_timeouts = if timed_out { consecutive_timeouts + 1 } else { 0 };
                    if self.heuristic.should_abort(consecutive_timeouts) {
                        warn!(consecutive_timeouts, "tool loop aborted after repeated timeouts");
                        out.abort_reason = Some(format!(
                            "{consecutive_timeouts} consecutive tool steps timed out"
                        ));
                        LoopState::Aborted
                    } else {
                        LoopState::Requesting
                    }
                }
                LoopState::Finalizing => {
                    if out.budget_exhausted.is_some() {
                        self.finalize(chain, &mut request, &mut out).await
                    } else {
                        LoopState::Done
                    }
                }
                LoopState::Done | LoopState::Aborted => break,
            };
            debug!(from = ?state, to = ?next, step = out.steps, "tool loop transition");
            out.state = next;
            out.transitions.push(next);
        }

        info!(
            steps = out.steps,
            tool_calls = out.tool_calls.len(),
            state = ?out.state,
            budget_exhausted = ?out.budget_exhausted,
            "tool loop finished"
        );
        out
    }

    fn abort_on_provider_error(&self, out: &mut ToolLoopOutcome, err: ProviderError) -> LoopState {
        let reason = if self.heuristic.is_provider_timeout(&err) {
            format!("provider unresponsive: {err}")
        } else {
            format!("provider failed: {err}")
        };
        warn!(reason = %reason, "tool loop aborted");
        out.abort_reason = Some(reason);
        out.provider_error = Some(err);
        LoopState::Aborted
    }

    /// Runs one step's calls. Returns `true` when every executed call in the
    /// step timed out.
    async fn execute_step(
        &self,
        calls: Vec<PendingCall>,
        tools: &ToolRegistry,
        locks: &ScopeLocks,
        context: &ToolContext,
        messages: &mut Vec<ChatMessage>,
        out: &mut ToolLoopOutcome,
    ) -> bool {
        let mut results = Vec::with_capacity(calls.len());
        let mut executed = 0usize;
        let mut timeouts = 0usize;

        for (i, call) in calls.into_iter().enumerate() {
            if i >= self.budget.max_tool_calls_per_step {
                debug!(tool = %call.name, "tool call over per-step cap");
                out.tool_calls.push(ToolCallRecord {
                    name: call.name,
                    is_error: true,
                    timed_out: false,
                    skipped: true,
                    elapsed_ms: 0,
                });
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id,
                    content: format!(
                        "skipped: at most {} tool calls are allowed per step",
                        self.budget.max_tool_calls_per_step
                    ),
                    is_error: true,
                });
                continue;
            }

            let side_effecting = tools
                .get(&call.name)
                .is_some_and(|tool| tool.is_side_effecting());
            let _guard = if side_effecting {
                Some(
                    locks
                        .acquire(
                            context.user_context_id.as_str(),
                            context.conversation_id.as_str(),
                        )
                        .await,
                )
            } else {
                None
            };

            let invocation = tools
                .execute(&call.name, context, call.input, self.budget.tool_exec_timeout)
                .await;
            let hit_timeout = invocation.timed_out
                || (invocation.output.is_error
                    && self.heuristic.is_likely_timeout(&invocation.output.content));
            executed += 1;
            if hit_timeout {
                timeouts += 1;
            }

            out.tool_calls.push(ToolCallRecord {
                name: invocation.name,
                is_error: invocation.output.is_error,
                timed_out: hit_timeout,
                skipped: false,
                elapsed_ms: invocation.elapsed_ms,
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id,
                content: invocation.output.content,
                is_error: invocation.output.is_error,
            });
        }

        messages.push(ChatMessage {
            role: ChatRole::User,
            content: MessagePart::Parts(results),
        });
        executed > 0 && timeouts == executed
    }

    /// One last request asking for an answer without further tool use.
    async fn finalize(
        &self,
        chain: &mut ProviderChain,
        request: &mut LlmRequest,
        out: &mut ToolLoopOutcome,
    ) -> LoopState {
        info!(limit = ?out.budget_exhausted, steps = out.steps, "tool budget exhausted, finalizing");
        push_user_text(&mut request.messages, FINALIZE_INSTRUCTION);
        match chain.complete(request).await {
            Ok(response) => {
                accumulate(&mut out.usage, response.usage);
                out.model = Some(response.model.clone());
                out.reply = response.text();
                out.finish_reason = response.finish_reason();
                LoopState::Done
            }
            Err(err) => self.abort_on_provider_error(out, err),
        }
    }
}

fn accumulate(total: &mut Usage, usage: Option<Usage>) {
    if let Some(u) = usage {
        total.input_tokens += u.input_tokens;
        total.output_tokens += u.output_tokens;
    }
}

fn tool_calls(content: &[ContentBlock]) -> Vec<PendingCall> {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(PendingCall {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            }),
            _ => None,
        })
        .collect()
}

/// Append text to the trailing user message, or start a new one.
fn push_user_text(messages: &mut Vec<ChatMessage>, text: &str) {
    if let Some(last) = messages.last_mut()
        && last.role == ChatRole::User
    {
        match &mut last.content {
            MessagePart::Parts(parts) => parts.push(ContentBlock::Text {
                text: text.to_string(),
            }),
            MessagePart::Text(existing) => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
        }
        return;
    }
    messages.push(ChatMessage::user(text));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_support::*;
    use crate::tools::test_support::{ScriptedTool, context};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use crate::providers::LlmResponse;

    fn budget(max_steps: usize) -> ToolLoopBudget {
        ToolLoopBudget {
            max_steps,
            max_duration: Duration::from_secs(30),
            max_tool_calls_per_step: 2,
            tool_exec_timeout: Duration::from_millis(50),
        }
    }

    fn heuristic() -> TimeoutHeuristic {
        TimeoutHeuristic::new(vec!["timed out".into(), "deadline".into()], 2)
    }

    fn base_request() -> LlmRequest {
        LlmRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::user("what's new in rust?")],
            system: Some("You are Nova.".into()),
            max_tokens: Some(256),
            temperature: None,
            tools: Vec::new(),
        }
    }

    fn registry(tool: ScriptedTool) -> ToolRegistry {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(tool));
        registry
    }

    #[tokio::test]
    async fn tool_then_answer_reaches_done() {
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![
                Ok(tool_response("t1", "web_search", serde_json::json!({"q": "rust"}))),
                Ok(text_response("Rust 1.90 shipped.")),
            ],
        ));
        let tool = ScriptedTool::ok("web_search", "release notes");
        let tool_calls = Arc::clone(&tool.calls);
        let mut chain = ProviderChain::new(vec![provider.clone()], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(4), heuristic())
            .run(&mut chain, &registry(tool), &ScopeLocks::new(), &context(), base_request())
            .await;

        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.reply, "Rust 1.90 shipped.");
        assert_eq!(outcome.steps, 2);
        assert_eq!(tool_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.transitions,
            vec![
                LoopState::Requesting,
                LoopState::ExecutingTools,
                LoopState::Requesting,
                LoopState::Finalizing,
                LoopState::Done
            ]
        );
        assert_eq!(outcome.usage.input_tokens, 20);

        let requests = provider.requests.lock().unwrap();
        let second = &requests[1];
        assert!(!second.tools.is_empty());
        assert!(matches!(
            &second.messages.last().unwrap().content,
            MessagePart::Parts(parts) if matches!(
                &parts[0],
                ContentBlock::ToolResult { content, is_error: false, .. } if content == "release notes"
            )
        ));
    }

    #[tokio::test]
    async fn step_budget_forces_final_answer() {
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![
                Ok(tool_response("t1", "web_search", serde_json::json!({}))),
                Ok(tool_response("t2", "web_search", serde_json::json!({}))),
                Ok(tool_response("t3", "web_search", serde_json::json!({}))),
                Ok(text_response("Here is what I found.")),
            ],
        ));
        let mut chain = ProviderChain::new(vec![provider.clone()], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(3), heuristic())
            .run(
                &mut chain,
                &registry(ScriptedTool::ok("web_search", "result")),
                &ScopeLocks::new(),
                &context(),
                base_request(),
            )
            .await;

        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.budget_exhausted, Some(BudgetLimit::Steps));
        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.reply, "Here is what I found.");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);

        let requests = provider.requests.lock().unwrap();
        let last = requests.last().unwrap().messages.last().unwrap().flat_text();
        assert!(last.contains("Do not call any more tools"));
    }

    #[tokio::test]
    async fn extra_calls_in_one_step_are_skipped() {
        let response = crate::providers::LlmResponse {
            content: vec![
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "web_search".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "web_search".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "c".into(),
                    name: "web_search".into(),
                    input: serde_json::json!({}),
                },
            ],
            ..tool_response("x", "web_search", serde_json::json!({}))
        };
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![Ok(response), Ok(text_response("done"))],
        ));
        let tool = ScriptedTool::ok("web_search", "r");
        let tool_calls = Arc::clone(&tool.calls);
        let mut chain = ProviderChain::new(vec![provider], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(4), heuristic())
            .run(&mut chain, &registry(tool), &ScopeLocks::new(), &context(), base_request())
            .await;

        assert_eq!(tool_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.tool_calls.len(), 3);
        assert!(outcome.tool_calls[2].skipped);
        assert_eq!(outcome.reply, "done");
    }

    #[tokio::test]
    async fn repeated_tool_timeouts_abort_the_loop() {
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![Ok(tool_response("t", "web_search", serde_json::json!({})))],
        ));
        let mut chain = ProviderChain::new(vec![provider.clone()], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(6), heuristic())
            .run(
                &mut chain,
                &registry(ScriptedTool::slow("web_search", Duration::from_millis(500))),
                &ScopeLocks::new(),
                &context(),
                base_request(),
            )
            .await;

        assert!(outcome.is_aborted());
        assert_eq!(outcome.steps, 2);
        assert!(outcome.reply.is_empty());
        assert!(outcome.tool_calls.iter().all(|c| c.timed_out));
    }

    #[tokio::test]
    async fn single_tool_timeout_is_fed_back_as_error() {
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![
                Ok(tool_response("t", "web_search", serde_json::json!({}))),
                Ok(text_response("Search was slow, but here's what I know.")),
            ],
        ));
        let mut chain = ProviderChain::new(vec![provider.clone()], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(4), heuristic())
            .run(
                &mut chain,
                &registry(ScriptedTool::slow("web_search", Duration::from_millis(500))),
                &ScopeLocks::new(),
                &context(),
                base_request(),
            )
            .await;

        assert_eq!(outcome.state, LoopState::Done);
        assert!(outcome.tool_calls[0].timed_out);
        let requests = provider.requests.lock().unwrap();
        assert!(requests[1].messages.last().unwrap().flat_text().contains("timed out"));
    }

    #[tokio::test]
    async fn provider_timeout_aborts_immediately() {
        let provider = Arc::new(ScriptedProvider::failing("mock", ProviderError::timeout(100)));
        let mut chain = ProviderChain::new(vec![provider.clone()], Duration::from_secs(5));

        let outcome = ToolLoop::new(budget(4), heuristic())
            .run(
                &mut chain,
                &registry(ScriptedTool::ok("web_search", "r")),
                &ScopeLocks::new(),
                &context(),
                base_request(),
            )
            .await;

        assert!(outcome.is_aborted());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.abort_reason.unwrap().contains("unresponsive"));
        assert_eq!(
            outcome.provider_error.map(|e| e.code),
            Some(ProviderErrorCode::Timeout)
        );
    }

    #[tokio::test]
    async fn step_with_one_answering_tool_is_not_a_timed_out_step() {
        let two_calls = LlmResponse {
            content: vec![
                ContentBlock::ToolUse {
                    id: "slow".into(),
                    name: "web_search".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::ToolUse {
                    id: "fast".into(),
                    name: "calendar".into(),
                    input: serde_json::json!({}),
                },
            ],
            ..tool_response("x", "web_search", serde_json::json!({}))
        };
        let provider = Arc::new(ScriptedProvider::new(
            "mock",
            vec![
                Ok(two_calls.clone()),
                Ok(two_calls.clone()),
                Ok(two_calls),
                Ok(text_response("Your calendar is clear.")),
            ],
        ));
        let mut chain = ProviderChain::new(vec![provider], Duration::from_secs(5));
        let mut tools = registry(ScriptedTool::slow("web_search", Duration::from_millis(500)));
        tools.register(Arc::new(ScriptedTool::ok("calendar", "no events")));

        let outcome = ToolLoop::new(budget(6), heuristic())
            .run(&mut chain, &tools, &ScopeLocks::new(), &context(), base_request())
            .await;

        assert_eq!(outcome.state, LoopState::Done);
        assert_eq!(outcome.reply, "Your calendar is clear.");
        assert_eq!(outcome.tool_calls.iter().filter(|c| c.timed_out).count(), 3);
    }

    #[test]
    fn heuristic_matches_markers_case_insensitively() {
        let h = heuristic();
        assert!(h.is_likely_timeout("Upstream DEADLINE exceeded"));
        assert!(!h.is_likely_timeout("not found"));
        assert!(!h.should_abort(1));
        assert!(h.should_abort(2));
        assert!(!TimeoutHeuristic::new(Vec::new(), 0).should_abort(10));
    }
}
