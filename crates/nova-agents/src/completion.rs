use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nova_common::{ProviderError, ProviderErrorCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::StreamWriter;
use crate::providers::{
    ContentBlock, ContentBlockDelta, FinishReason, LlmProvider, LlmRequest, LlmResponse,
    LlmStreamResponse, Usage, complete_with_timeout, normalize_error,
};

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// How a turn talks to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    Direct,
    Streaming,
    ToolCalling,
}

/// Vendor-neutral result of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub reply: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
    pub provider: String,
    pub model: String,
}

impl Completion {
    pub fn from_response(response: &LlmResponse, provider: &str) -> Self {
        let usage = response.usage.unwrap_or_default();
        Self {
            reply: response.text(),
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            finish_reason: response.finish_reason(),
            provider: provider.to_string(),
            model: response.model.clone(),
        }
    }
}

/// Ordered providers for one turn. Retryable failures advance to the next
/// provider and the chain stays there for the rest of the turn.
pub struct ProviderChain {
    providers: Vec<Arc<dyn LlmProvider>>,
    active: usize,
    request_timeout: Duration,
    fallbacks_taken: usize,
    /// Text already forwarded by a stream that then failed.
    partial_text: Option<String>,
}

impl ProviderChain {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>, request_timeout: Duration) -> Self {
        Self {
            providers,
            active: 0,
            request_timeout,
            fallbacks_taken: 0,
            partial_text: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn active_provider_id(&self) -> Option<&str> {
        self.providers.get(self.active).map(|p| p.provider_id())
    }

    /// Number of times the chain moved past a failed provider.
    pub fn fallbacks_taken(&self) -> usize {
        self.fallbacks_taken
    }

    /// Text a failed stream had already delivered, taken once.
    pub fn take_partial_text(&mut self) -> Option<String> {
        self.partial_text.take()
    }

    fn no_provider() -> ProviderError {
        ProviderError::new(ProviderErrorCode::Unavailable, "no LLM provider configured")
    }

    /// Advance past the active provider if `err` allows it.
    fn try_advance(&mut self, err: &ProviderError) -> bool {
        if !err.is_retryable() || self.active + 1 >= self.providers.len() {
            return false;
        }
        warn!(
            provider = self.active_provider_id().unwrap_or_default(),
            error = %err,
            "provider failed, falling back"
        );
        self.active += 1;
        self.fallbacks_taken += 1;
        true
    }

    pub async fn complete(&mut self, request: &LlmRequest) -> ProviderResult<LlmResponse> {
        if self.providers.is_empty() {
            return Err(Self::no_provider());
        }
        loop {
            let provider = Arc::clone(&self.providers[self.active]);
            match complete_with_timeout(provider.as_ref(), request, self.request_timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    let err = normalize_error(e);
                    if !self.try_advance(&err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Stream a completion, forwarding text deltas to `writer` as they arrive.
    ///
    /// Fallback only happens before the first delta is forwarded; once text
    /// has reached subscribers a failure is returned as-is and the forwarded
    /// text is kept for [`ProviderChain::take_partial_text`].
    pub async fn stream(
        &mut self,
        request: &LlmRequest,
        writer: &mut StreamWriter,
    ) -> ProviderResult<LlmResponse> {
        if self.providers.is_empty() {
            return Err(Self::no_provider());
        }
        loop {
            let provider = Arc::clone(&self.providers[self.active]);
            let mut acc = StreamAccumulator::default();
            let attempt = tokio::time::timeout(self.request_timeout, async {
                let mut events = provider.stream(request).await.map_err(normalize_error)?;
                while let Some(event) = events.next().await {
                    let event = event.map_err(normalize_error)?;
                    if let Some(text) = acc.apply(event) {
                        writer.delta(&text);
                    }
                }
                Ok::<_, ProviderError>(())
            })
            .await;

            let err = match attempt {
                Ok(Ok(())) => return Ok(acc.finish(&request.model)),
                Ok(Err(err)) => err,
                Err(_) => ProviderError::timeout(self.request_timeout.as_millis() as u64),
            };
            let forwarded = acc.text();
            if !forwarded.is_empty() {
                debug!(chars = forwarded.len(), error = %err, "stream failed after forwarding text");
                self.partial_text = Some(forwarded);
                return Err(err);
            }
            if !self.try_advance(&err) {
                return Err(err);
            }
        }
    }
}

enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// Folds stream events back into a complete response.
#[derive(Default)]
struct StreamAccumulator {
    blocks: BTreeMap<u32, PartialBlock>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamAccumulator {
    /// Returns the text to forward, if the event carried any.
    fn apply(&mut self, event: LlmStreamResponse) -> Option<String> {
        match event {
            LlmStreamResponse::MessageStart { usage } => {
                if let Some(u) = usage {
                    self.usage.input_tokens = u.input_tokens;
                }
                None
            }
            LlmStreamResponse::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    ContentBlock::ToolUse { id, name, .. } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                    ContentBlock::Text { text } => PartialBlock::Text(text),
                    ContentBlock::ToolResult { .. } => return None,
                };
                self.blocks.insert(index, block);
                None
            }
            LlmStreamResponse::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::Text { text } => {
                    match self
                        .blocks
                        .entry(index)
                        .or_insert_with(|| PartialBlock::Text(String::new()))
                    {
                        PartialBlock::Text(buf) => buf.push_str(&text),
                        PartialBlock::ToolUse { .. } => return None,
                    }
                    Some(text)
                }
                ContentBlockDelta::ToolUse { partial_json } => {
                    if let Some(PartialBlock::ToolUse { json, .. }) = self.blocks.get_mut(&index) {
                        json.push_str(&partial_json);
                    }
                    None
                }
            },
            LlmStreamResponse::MessageStop { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(u) = usage {
                    if u.input_tokens > 0 {
                        self.usage.input_tokens = u.input_tokens;
                    }
                    self.usage.output_tokens = u.output_tokens;
                }
                None
            }
            LlmStreamResponse::ContentBlockStop { .. } | LlmStreamResponse::Ping => None,
        }
    }

    /// Text received so far, in block order.
    fn text(&self) -> String {
        self.blocks
            .values()
            .filter_map(|block| match block {
                PartialBlock::Text(text) => Some(text.as_str()),
                PartialBlock::ToolUse { .. } => None,
            })
            .collect()
    }

    fn finish(self, model: &str) -> LlmResponse {
        let content = self
            .blocks
            .into_values()
            .map(|block| match block {
                PartialBlock::Text(text) => ContentBlock::Text { text },
                PartialBlock::ToolUse { id, name, json } => {
                    let input = if json.trim().is_empty() {
                        serde_json::json!({})
                    } else {
                        serde_json::from_str(&json).unwrap_or_else(|e| {
                            debug!(tool = %name, error = %e, "unparseable streamed tool input");
                            serde_json::json!({})
                        })
                    };
                    ContentBlock::ToolUse { id, name, input }
                }
            })
            .collect();
        LlmResponse {
            content,
            model: model.to_string(),
            usage: Some(self.usage),
            stop_reason: self.stop_reason,
        }
    }
}
