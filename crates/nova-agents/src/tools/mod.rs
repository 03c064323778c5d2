use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nova_common::{ConversationId, Result, SessionKey, Turn, UserContextId};
use nova_security::CapabilityGate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::providers::ToolDefinition;

pub mod report;

pub use report::DeliverReport;

/// A tool the model (or a fast path) may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn input_schema(&self) -> serde_json::Value;

    /// Capabilities checked by the [`CapabilityGate`] before execution.
    fn required_capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    /// Side-effecting tools are serialised per `(user, conversation)` scope.
    fn is_side_effecting(&self) -> bool {
        false
    }

    async fn execute(&self, context: &ToolContext, input: serde_json::Value) -> Result<ToolOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Identity of the turn on whose behalf a tool runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub turn_id: String,
    pub user_context_id: UserContextId,
    pub conversation_id: ConversationId,
    pub session_key: SessionKey,
}

impl ToolContext {
    pub fn for_turn(turn: &Turn) -> Self {
        Self {
            turn_id: turn.turn_id.clone(),
            user_context_id: turn.user_context_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            session_key: turn.session_key.clone(),
        }
    }
}

/// Result of running one tool call through the registry.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub output: ToolOutput,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// Externally registered tool set, consulted by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    gate: CapabilityGate,
}

impl ToolRegistry {
    pub fn new(gate: CapabilityGate) -> Self {
        Self {
            tools: HashMap::new(),
            gate,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions advertised to the model, sorted by name for a stable prompt.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Run one call. Never fails: unknown tools, capability denials, errors and
    /// timeouts all come back as an error [`ToolOutput`].
    pub async fn execute(
        &self,
        name: &str,
        context: &ToolContext,
        input: serde_json::Value,
        timeout: Duration,
    ) -> ToolInvocation {
        let started = Instant::now();
        let finish = |output: ToolOutput, timed_out: bool| ToolInvocation {
            name: name.to_string(),
            output,
            timed_out,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let Some(tool) = self.get(name) else {
            return finish(ToolOutput::error(format!("unknown tool: {name}")), false);
        };

        if !self.gate.allowed(name, tool.required_capabilities()) {
            return finish(
                ToolOutput::error(format!("tool '{name}' is not permitted in this context")),
                false,
            );
        }

        match tokio::time::timeout(timeout, tool.execute(context, input)).await {
            Ok(Ok(output)) => finish(output, false),
            Ok(Err(e)) => {
                warn!(tool = name, error = %e, "tool execution failed");
                finish(ToolOutput::error(e.to_string()), false)
            }
            Err(_) => {
                warn!(tool = name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                finish(
                    ToolOutput::error(format!(
                        "tool '{name}' timed out after {}ms",
                        timeout.as_millis()
                    )),
                    true,
                )
            }
        }
    }
}
