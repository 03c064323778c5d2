use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use nova_common::{Error, InboundTurn, ProviderError, Result, Turn};
use nova_config::{AgentConfig, AppConfig, ToolLoopConfig};
use nova_db::MemoryRole;
use nova_security::CapabilityGate;
use serde_json::json;
use tracing::{Span, debug, info, instrument, warn};

use crate::completion::{Completion, CompletionMode, ProviderChain};
use crate::events::{EventBus, StreamWriter};
use crate::fast_path::{FastPathKind, FastPathResult, FastPathRouter};
use crate::ledger::{DedupeDecision, IdempotencyLedger, ScopeLocks, TurnDedupe};
use crate::memory::MemoryRecall;
use crate::persistence::PersistenceSink;
use crate::policy::{ExecutionPolicy, PolicyDefaults};
use crate::prompt::{BuiltPrompt, CharTokenEstimator, PromptBuilder, PromptContext, TokenEstimator};
use crate::providers::{ChatMessage, FinishReason, LlmProvider, LlmRequest};
use crate::refine::{Draft, Refiner, ReplyConstraint, ReplyRetry};
use crate::summary::{Route, RunSummary, TurnOutcome};
use crate::tool_loop::{TimeoutHeuristic, ToolLoop, ToolLoopBudget};
use crate::tools::{Tool, ToolContext, ToolRegistry};

/// Tool consulted for research preloading when the policy asks for it.
pub const WEB_SEARCH_TOOL: &str = "web_search";

const DEFAULT_PERSONA: &str = "You are Nova, a concise and helpful assistant.";
const HISTORY_LIMIT: usize = 40;

/// Runs one inbound turn from dedupe to persisted reply.
pub struct TurnPipeline {
    providers: RwLock<Vec<Arc<dyn LlmProvider>>>,
    default_provider: RwLock<Option<String>>,
    fallback_provider_ids: RwLock<Vec<String>>,
    tools: ToolRegistry,
    memory: Option<Arc<dyn MemoryRecall>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    events: EventBus,
    prompt: PromptBuilder,
    agent: AgentConfig,
    tool_loop: ToolLoopConfig,
    dedupe: TurnDedupe,
    bucket_ms: i64,
    ledger: Arc<IdempotencyLedger>,
    locks: Arc<ScopeLocks>,
    fast_path: FastPathRouter,
    refiner: Refiner,
}

impl TurnPipeline {
    pub fn new(config: &AppConfig) -> Self {
        let gate = if config.security.enforce_capabilities {
            CapabilityGate::enforcing(config.security.granted_capabilities.iter().cloned())
        } else {
            CapabilityGate::permissive()
        };
        let pipeline = Self {
            providers: RwLock::new(Vec::new()),
            default_provider: RwLock::new(config.agent.default_provider.clone()),
            fallback_provider_ids: RwLock::new(Vec::new()),
            tools: ToolRegistry::new(gate),
            memory: None,
            persistence: None,
            events: EventBus::default(),
            prompt: PromptBuilder::new(config.prompt.clone(), Arc::new(CharTokenEstimator::default())),
            agent: config.agent.clone(),
            tool_loop: config.tool_loop.clone(),
            dedupe: TurnDedupe::new(config.dedupe.debounce_window_ms),
            bucket_ms: config.dedupe.bucket_ms,
            ledger: Arc::new(IdempotencyLedger::new(Duration::from_secs(
                config.idempotency.default_ttl_secs,
            ))),
            locks: Arc::new(ScopeLocks::new()),
            fast_path: FastPathRouter::new(&config.fast_path),
            refiner: Refiner::new(config.refine.clone()),
        };
        pipeline.set_fallback_provider_ids(&config.agent.fallback_providers);
        pipeline
    }

    // -- providers ----------------------------------------------------------

    /// Register a provider. The first one registered becomes the default
    /// unless configuration named another.
    pub fn register_provider(&self, provider: Arc<dyn LlmProvider>) {
        let id = provider.provider_id().to_string();
        info!("registered LLM provider: {}", id);
        {
            let mut default = self
                .default_provider
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if default.is_none() {
                *default = Some(id);
            }
        }
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub fn get_provider(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.provider_id() == id)
            .cloned()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|p| p.provider_id().to_string())
            .collect()
    }

    /// Set the default provider by ID. Returns `true` if the provider exists.
    pub fn set_default_provider_id(&self, id: &str) -> bool {
        let exists = self.get_provider(id).is_some();
        if exists {
            *self
                .default_provider
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(id.to_string());
        }
        exists
    }

    pub fn default_provider_id(&self) -> Option<String> {
        self.default_provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Set the fallback chain tried after the default provider.
    pub fn set_fallback_provider_ids(&self, ids: &[String]) {
        let mut deduped: Vec<String> = Vec::new();
        for id in ids {
            let trimmed = id.trim();
            if trimmed.is_empty() || deduped.iter().any(|existing| existing == trimmed) {
                continue;
            }
            deduped.push(trimmed.to_string());
        }
        *self
            .fallback_provider_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner) = deduped;
    }

    pub fn fallback_provider_ids(&self) -> Vec<String> {
        self.fallback_provider_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Providers for one turn: the hinted provider alone, or the default
    /// followed by the registered fallbacks.
    fn provider_chain(&self, hint: Option<&str>) -> Vec<Arc<dyn LlmProvider>> {
        if let Some(id) = hint {
            match self.get_provider(id) {
                Some(provider) => return vec![provider],
                None => warn!("requested provider '{}' is not registered; using default chain", id),
            }
        }

        let Some(default_id) = self.default_provider_id() else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        match self.get_provider(&default_id) {
            Some(primary) => chain.push(primary),
            None => warn!("default provider '{}' is not registered", default_id),
        }
        for fallback_id in self.fallback_provider_ids() {
            if chain.iter().any(|p| p.provider_id() == fallback_id) {
                continue;
            }
            match self.get_provider(&fallback_id) {
                Some(provider) => chain.push(provider),
                None => warn!(
                    "configured fallback provider '{}' is not registered; skipping",
                    fallback_id
                ),
            }
        }
        chain
    }

    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let providers: Vec<Arc<dyn LlmProvider>> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let checks = providers.iter().map(|provider| async {
            let provider_id = provider.provider_id().to_string();
            let ok = provider.health_check().await.unwrap_or(false);
            (provider_id, ok)
        });
        join_all(checks).await
    }

    // -- collaborators ------------------------------------------------------

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn set_memory(&mut self, memory: Arc<dyn MemoryRecall>) {
        self.memory = Some(memory);
        info!("memory recall attached to turn pipeline");
    }

    pub fn set_persistence(&mut self, sink: Arc<dyn PersistenceSink>) {
        self.persistence = Some(sink);
    }

    pub fn set_event_bus(&mut self, events: EventBus) {
        self.events = events;
    }

    pub fn set_token_estimator(&mut self, estimator: Arc<dyn TokenEstimator>) {
        self.prompt = PromptBuilder::new(self.prompt.budget().clone(), estimator);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Shared with side-effecting tools such as report delivery.
    pub fn ledger(&self) -> Arc<IdempotencyLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn scope_locks(&self) -> Arc<ScopeLocks> {
        Arc::clone(&self.locks)
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_loop.tool_exec_timeout_ms)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_loop.request_timeout_ms)
    }

    // -- turn processing ----------------------------------------------------

    #[instrument(
        skip(self, inbound),
        fields(
            conversation_id = %inbound.conversation_id.as_str(),
            source = ?inbound.source,
            turn_id,
            route
        )
    )]
    pub async fn process_turn(&self, inbound: InboundTurn) -> Result<TurnOutcome> {
        let started = Instant::now();
        let turn = Turn::receive(inbound, self.bucket_ms);
        Span::current().record("turn_id", turn.turn_id.as_str());

        if turn.cleaned_text.is_empty() {
            return Err(Error::Agent("turn text is empty".to_string()));
        }

        if let DedupeDecision::Duplicate {
            signature,
            first_seen_ms,
        } = self
            .dedupe
            .check(turn.session_key.as_str(), &turn.cleaned_text)
        {
            info!(turn_id = %turn.turn_id, "duplicate turn suppressed");
            return Ok(TurnOutcome::Duplicate {
                turn_id: turn.turn_id,
                signature,
                first_seen_ms,
            });
        }

        let mut writer = self.events.writer_for(&turn);
        writer.start(json!({
            "source": turn.source,
            "session_key": turn.session_key,
        }));

        let stage = Instant::now();
        let fast = self
            .fast_path
            .classify(&turn, &self.tools, self.tool_timeout())
            .await;
        let mut summary = match fast {
            Some(result) => {
                let mut summary = self.fast_path_summary(&turn, result);
                summary.latency.record("fast_path", stage);
                summary
            }
            None => {
                let mut summary = self.run_model_path(&turn, &mut writer).await;
                summary.latency.record("fast_path", stage);
                summary
            }
        };
        Span::current().record("route", tracing::field::debug(summary.route));

        if !writer.has_deltas() {
            writer.delta(&summary.reply);
        }
        writer.done(json!({
            "reply": summary.reply,
            "route": summary.route,
            "ok": summary.ok,
            "fallback_stage": summary.fallback_stage,
        }));

        let stage = Instant::now();
        self.persist(&turn, &summary).await;
        summary.latency.record("persist", stage);

        summary.latency.total_ms = started.elapsed().as_millis() as u64;
        info!(
            turn_id = %summary.turn_id,
            route = ?summary.route,
            ok = summary.ok,
            provider = summary.provider.as_deref().unwrap_or("-"),
            prompt_tokens = summary.prompt_tokens,
            completion_tokens = summary.completion_tokens,
            tool_calls = summary.tool_calls.len(),
            retries = summary.retries,
            fallback_stage = summary.fallback_stage.as_deref().unwrap_or("-"),
            latency_ms = summary.latency.total_ms,
            "turn complete"
        );
        Ok(TurnOutcome::Replied(summary))
    }

    fn fast_path_summary(&self, turn: &Turn, result: FastPathResult) -> RunSummary {
        let route = match &result {
            FastPathResult::Clarify { .. } => Route::FastPathClarify,
            FastPathResult::Reply {
                kind: FastPathKind::Weather,
                ..
            } => Route::FastPathWeather,
            FastPathResult::Reply {
                kind: FastPathKind::Crypto,
                ..
            } => Route::FastPathCrypto,
        };
        let mut summary = RunSummary::new(&turn.turn_id, route);
        summary.reply = result.text().to_string();
        summary.ok = !summary.reply.trim().is_empty();
        summary
    }

    async fn run_model_path(&self, turn: &Turn, writer: &mut StreamWriter) -> RunSummary {
        let has_tools = !self.tools.is_empty();
        let policy = ExecutionPolicy::compute(
            turn,
            PolicyDefaults {
                tool_loop_enabled: self.tool_loop.enabled,
                stream_by_default: self.agent.stream_by_default,
                has_tools,
                has_web_search: self.tools.contains(WEB_SEARCH_TOOL),
            },
        );
        debug!(?policy, "execution policy");

        let mode = if policy.tool_loop {
            CompletionMode::ToolCalling
        } else if policy.stream {
            CompletionMode::Streaming
        } else {
            CompletionMode::Direct
        };
        let route = match mode {
            CompletionMode::ToolCalling => Route::ToolLoop,
            CompletionMode::Streaming => Route::Streaming,
            CompletionMode::Direct => Route::Direct,
        };
        let mut summary = RunSummary::new(&turn.turn_id, route);

        let stage = Instant::now();
        let constraint = ReplyConstraint::detect(&turn.cleaned_text);
        let context = self.gather_context(turn, &policy, constraint).await;
        let history = self.load_history(turn).await;
        summary.latency.record("context", stage);

        let stage = Instant::now();
        let prompt = self.prompt.build(turn, &context, &history);
        summary.prompt_hash = Some(prompt.prompt_hash.clone());
        summary.latency.record("prompt", stage);

        let max_tokens = policy.max_tokens(self.agent.max_tokens);
        let request = self.request_for(turn, &prompt, max_tokens);
        let mut chain = ProviderChain::new(
            self.provider_chain(turn.hints.provider.as_deref()),
            self.request_timeout(),
        );

        let stage = Instant::now();
        let draft = self.complete(mode, &mut chain, turn, request.clone(), writer, &mut summary).await;
        summary.latency.record("completion", stage);

        let stage = Instant::now();
        let failure = draft.failure.clone();
        let mut retry = ChainRetry {
            chain: &mut chain,
            request,
        };
        let refined = self
            .refiner
            .refine(
                Draft {
                    reply: &draft.reply,
                    request_text: &turn.cleaned_text,
                    constraint,
                    finish_reason: draft.finish_reason,
                    completion_tokens: draft.completion_tokens,
                    max_tokens,
                    failure,
                },
                &mut retry,
            )
            .await;
        summary.latency.record("refine", stage);

        if let Some(extra) = &refined.retry {
            summary.retries += 1;
            summary.prompt_tokens += extra.prompt_tokens;
            summary.completion_tokens += extra.completion_tokens;
        }
        summary.retries += chain.fallbacks_taken();
        summary.reply = refined.reply.clone();
        summary.ok = !summary.reply.trim().is_empty();
        summary.fallback_stage = refined.fallback_stage().map(str::to_string);
        summary.fallback_reason = refined.fallback_reason.clone();
        if summary.provider.is_none() {
            summary.provider = chain.active_provider_id().map(str::to_string);
        }
        summary
    }

    async fn gather_context(
        &self,
        turn: &Turn,
        policy: &ExecutionPolicy,
        constraint: Option<ReplyConstraint>,
    ) -> PromptContext {
        let text = turn.cleaned_text.as_str();
        let user = turn.user_context_id.as_str();

        let memory = async {
            let Some(memory) = self.memory.as_ref().filter(|_| policy.memory_recall) else {
                return Vec::new();
            };
            match memory.recall(user, text, self.agent.recall_limit).await {
                Ok(snippets) => snippets,
                Err(e) => {
                    warn!("memory recall failed, continuing without context: {}", e);
                    Vec::new()
                }
            }
        };

        let research = async {
            if !policy.web_search_preload {
                return None;
            }
            let invocation = self
                .tools
                .execute(
                    WEB_SEARCH_TOOL,
                    &ToolContext::for_turn(turn),
                    json!({ "query": text }),
                    self.tool_timeout(),
                )
                .await;
            if invocation.output.is_error {
                warn!(error = %invocation.output.content, "web search preload failed");
                return None;
            }
            Some(invocation.output.content)
        };

        let preferences = async {
            let memory = self.memory.as_ref()?;
            match memory.preferences(user).await {
                Ok(prefs) if !prefs.is_empty() => Some(
                    prefs
                        .iter()
                        .map(|(key, value)| format!("- {key}: {value}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                Ok(_) => None,
                Err(e) => {
                    warn!("failed to load preferences, continuing without them: {}", e);
                    None
                }
            }
        };

        let (memory, research, preferences) = tokio::join!(memory, research, preferences);

        let mut skills = self.agent.skills.clone();
        if policy.tool_loop {
            skills.extend(
                self.tools
                    .definitions()
                    .into_iter()
                    .map(|def| format!("{}: {}", def.name, def.description)),
            );
        }

        let mut persona = self
            .agent
            .persona
            .clone()
            .unwrap_or_else(|| DEFAULT_PERSONA.to_string());
        if let Some(constraint) = constraint {
            persona.push_str("\n\n");
            persona.push_str(&constraint.instruction());
        }

        PromptContext {
            memory,
            research,
            preferences,
            skills,
            ..PromptContext::with_persona(persona)
        }
    }

    async fn load_history(&self, turn: &Turn) -> Vec<ChatMessage> {
        let Some(sink) = &self.persistence else {
            return Vec::new();
        };
        match sink
            .load_history(turn.conversation_id.as_str(), HISTORY_LIMIT)
            .await
        {
            Ok(turns) => turns
                .into_iter()
                .filter_map(|t| match t.role.as_str() {
                    "user" => Some(ChatMessage::user(t.text)),
                    "assistant" => Some(ChatMessage::assistant(t.text)),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!("failed to load history, continuing without it: {}", e);
                Vec::new()
            }
        }
    }

    fn request_for(&self, turn: &Turn, prompt: &BuiltPrompt, max_tokens: u32) -> LlmRequest {
        LlmRequest {
            model: turn
                .hints
                .model
                .clone()
                .or_else(|| self.agent.model.clone())
                .unwrap_or_default(),
            messages: prompt.messages(),
            system: Some(prompt.system_prompt.clone()),
            max_tokens: Some(max_tokens),
            temperature: None,
            tools: Vec::new(),
        }
    }

    async fn complete(
        &self,
        mode: CompletionMode,
        chain: &mut ProviderChain,
        turn: &Turn,
        request: LlmRequest,
        writer: &mut StreamWriter,
        summary: &mut RunSummary,
    ) -> DraftReply {
        let result = match mode {
            CompletionMode::ToolCalling => {
                let runner = ToolLoop::new(
                    ToolLoopBudget::from(&self.tool_loop),
                    TimeoutHeuristic::from_config(&self.tool_loop),
                );
                let outcome = runner
                    .run(
                        chain,
                        &self.tools,
                        &self.locks,
                        &ToolContext::for_turn(turn),
                        request,
                    )
                    .await;
                summary.tool_calls = outcome.tool_calls.clone();
                summary.prompt_tokens += outcome.usage.input_tokens;
                summary.completion_tokens += outcome.usage.output_tokens;
                summary.model = outcome.model.clone();
                if outcome.is_aborted() {
                    let failure = match &outcome.provider_error {
                        Some(err) => provider_failure(err),
                        None => "tool_loop_aborted".to_string(),
                    };
                    return DraftReply::failed(failure);
                }
                return DraftReply {
                    reply: outcome.reply,
                    finish_reason: Some(outcome.finish_reason),
                    completion_tokens: outcome.usage.output_tokens,
                    failure: None,
                };
            }
            CompletionMode::Streaming => chain.stream(&request, writer).await,
            CompletionMode::Direct => chain.complete(&request).await,
        };

        match result {
            Ok(response) => {
                let completion =
                    Completion::from_response(&response, chain.active_provider_id().unwrap_or_default());
                summary.prompt_tokens += completion.prompt_tokens;
                summary.completion_tokens += completion.completion_tokens;
                summary.model = Some(completion.model.clone());
                summary.provider = Some(completion.provider.clone());
                DraftReply {
                    reply: completion.reply,
                    finish_reason: Some(completion.finish_reason),
                    completion_tokens: completion.completion_tokens,
                    failure: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "model call failed");
                let mut draft = DraftReply::failed(provider_failure(&err));
                if let Some(partial) = chain.take_partial_text() {
                    draft.reply = partial;
                }
                draft
            }
        }
    }

    async fn persist(&self, turn: &Turn, summary: &RunSummary) {
        let conversation = turn.conversation_id.as_str();

        if let Some(sink) = &self.persistence {
            let user_meta = json!({ "turn_id": turn.turn_id, "source": turn.source });
            if let Err(e) = sink
                .append_transcript_turn(conversation, "user", &turn.raw_text, user_meta)
                .await
            {
                warn!("failed to store user turn: {}", e);
            }

            let assistant_meta = json!({
                "turn_id": turn.turn_id,
                "route": summary.route,
                "provider": summary.provider,
                "model": summary.model,
                "fallback_stage": summary.fallback_stage,
                "prompt_hash": summary.prompt_hash,
            });
            if let Err(e) = sink
                .append_transcript_turn(conversation, "assistant", &summary.reply, assistant_meta)
                .await
            {
                warn!("failed to store assistant turn: {}", e);
            }

            if let Some(model) = &summary.model
                && (summary.prompt_tokens > 0 || summary.completion_tokens > 0)
                && let Err(e) = sink
                    .persist_usage(model, summary.prompt_tokens, summary.completion_tokens)
                    .await
            {
                warn!("failed to persist usage: {}", e);
            }
        }

        if let Some(memory) = &self.memory
            && !summary.route.is_fast_path()
        {
            let user = turn.user_context_id.as_str();
            for (role, content) in [
                (MemoryRole::User, turn.cleaned_text.as_str()),
                (MemoryRole::Assistant, summary.reply.as_str()),
            ] {
                if let Err(e) = memory.remember(user, conversation, role, content).await {
                    warn!("failed to store turn in memory: {}", e);
                }
            }
        }
    }
}

fn provider_failure(err: &ProviderError) -> String {
    format!("provider_error:{}", err.code.as_str())
}

/// Model output before refinement.
struct DraftReply {
    reply: String,
    finish_reason: Option<FinishReason>,
    completion_tokens: u32,
    failure: Option<String>,
}

impl DraftReply {
    fn failed(failure: String) -> Self {
        Self {
            reply: String::new(),
            finish_reason: None,
            completion_tokens: 0,
            failure: Some(failure),
        }
    }
}

/// Re-issues the turn's request through the same provider chain.
struct ChainRetry<'a> {
    chain: &'a mut ProviderChain,
    request: LlmRequest,
}

#[async_trait]
impl ReplyRetry for ChainRetry<'_> {
    async fn retry(&mut self, max_tokens: u32) -> Option<Completion> {
        let request = LlmRequest {
            max_tokens: Some(max_tokens),
            tools: Vec::new(),
            ..self.request.clone()
        };
        match self.chain.complete(&request).await {
            Ok(response) => Some(Completion::from_response(
                &response,
                self.chain.active_provider_id().unwrap_or_default(),
            )),
            Err(e) => {
                warn!(error = %e, "recovery request failed");
                None
            }
        }
    }
}
