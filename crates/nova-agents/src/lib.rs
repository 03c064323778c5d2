pub mod completion;
pub mod events;
pub mod fast_path;
pub mod ledger;
pub mod memory;
pub mod persistence;
pub mod pipeline;
pub mod policy;
pub mod prompt;
pub mod providers;
pub mod refine;
pub mod summary;
pub mod tool_loop;
pub mod tools;

pub use completion::{Completion, CompletionMode, ProviderChain};
pub use events::{EventBus, LifecycleEvent, LifecycleKind, StreamWriter};
pub use fast_path::{FastPathKind, FastPathResult, FastPathRouter};
pub use ledger::{ClaimOutcome, ClaimStatus, DedupeDecision, IdempotencyLedger, ScopeLocks, TurnDedupe};
pub use memory::{MemoryRecall, SqliteMemory};
pub use persistence::{PersistenceSink, SqlitePersistence};
pub use pipeline::TurnPipeline;
pub use policy::{ExecutionPolicy, LatencyLane};
pub use prompt::{BuiltPrompt, CharTokenEstimator, PromptBuilder, PromptContext, TokenEstimator};
pub use providers::{
    AnthropicProvider, ChatMessage, ChatRole, ContentBlock, FinishReason, LlmProvider, LlmRequest,
    LlmResponse, LlmStreamResponse, MessagePart, OpenAiProvider, ToolDefinition, Usage,
};
pub use refine::{Refiner, ReplyConstraint, Strategy};
pub use summary::{Route, RunSummary, StageLatency, TurnOutcome};
pub use tool_loop::{LoopState, TimeoutHeuristic, ToolLoop, ToolLoopBudget, ToolLoopOutcome};
pub use tools::{DeliverReport, Tool, ToolContext, ToolOutput, ToolRegistry};
