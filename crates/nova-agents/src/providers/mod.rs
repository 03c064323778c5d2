use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use nova_common::{Error, ProviderError, ProviderErrorCode, Result};
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Trait for LLM backends. Adapters must surface failures as
/// `Error::Provider(ProviderError)` rather than vendor-specific shapes.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "openai").
    fn provider_id(&self) -> &str;

    /// Send a completion request and return the response.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Stream a completion response.
    ///
    /// The default replays a non-streaming completion as a single burst of events.
    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamResponse>>> {
        let response = self.complete(request).await?;
        Ok(stream::iter(replay_as_events(response).into_iter().map(Ok)).boxed())
    }

    /// Check if the provider is available and configured.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: MessagePart,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessagePart::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessagePart::Text(text.into()),
        }
    }

    /// Concatenated text of the message, tool payloads included.
    pub fn flat_text(&self) -> String {
        match &self.content {
            MessagePart::Text(t) => t.clone(),
            MessagePart::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolUse { name, input, .. } => format!("{name} {input}"),
                    ContentBlock::ToolResult { content, .. } => content.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePart {
    Text(String),
    Parts(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

impl LlmResponse {
    pub fn text(&self) -> String {
        extract_text(&self.content)
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }

    pub fn finish_reason(&self) -> FinishReason {
        FinishReason::from_stop_reason(self.stop_reason.as_deref())
    }
}

/// Vendor-neutral reason a completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Unknown,
}

impl FinishReason {
    pub fn from_stop_reason(reason: Option<&str>) -> Self {
        match reason.map(str::to_ascii_lowercase).as_deref() {
            Some("stop" | "end_turn" | "stop_sequence") => Self::Stop,
            Some("length" | "max_tokens") => Self::Length,
            Some("tool_use" | "tool_calls" | "function_call") => Self::ToolUse,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LlmStreamResponse {
    MessageStart {
        usage: Option<Usage>,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageStop {
        stop_reason: Option<String>,
        usage: Option<Usage>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlockDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    ToolUse { partial_json: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

pub fn extract_text(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run `complete` under a hard deadline, normalizing the elapsed case.
pub async fn complete_with_timeout(
    provider: &dyn LlmProvider,
    request: &LlmRequest,
    timeout: Duration,
) -> Result<LlmResponse> {
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Ok(result) => result.map_err(|e| Error::Provider(normalize_error(e))),
        Err(_) => Err(ProviderError::timeout(timeout.as_millis() as u64).into()),
    }
}

/// Collapse any error into the `{status, code, message}` shape.
///
/// Adapters already produce `Error::Provider`; anything else is classified by
/// status markers and transport keywords found in the message.
pub fn normalize_error(error: Error) -> ProviderError {
    match error {
        Error::Provider(e) => e,
        Error::Timeout(ms) => ProviderError::timeout(ms),
        Error::Serialization(e) => ProviderError::malformed(e.to_string()),
        other => {
            let message = other.to_string();
            let lowered = message.to_ascii_lowercase();
            if let Some(status) = extract_status_code(&lowered) {
                return ProviderError::from_status(status, message);
            }
            let code = if lowered.contains("timed out") || lowered.contains("timeout") {
                ProviderErrorCode::Timeout
            } else if [
                "connection refused",
                "connection reset",
                "connection aborted",
                "temporarily unavailable",
                "dns error",
                "network error",
            ]
            .iter()
            .any(|fragment| lowered.contains(fragment))
            {
                ProviderErrorCode::Network
            } else {
                ProviderErrorCode::Unknown
            };
            ProviderError::new(code, message)
        }
    }
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> Error {
    let code = if err.is_timeout() {
        ProviderErrorCode::Timeout
    } else if err.is_decode() {
        ProviderErrorCode::MalformedResponse
    } else {
        ProviderErrorCode::Network
    };
    ProviderError::new(code, format!("network error: {err}")).into()
}

fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let marker_start = search_start + offset;
            let after_marker = marker_start + marker.len();
            let remainder = message[after_marker..].trim_start();
            let digits: String = remainder
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() >= 3
                && let Ok(status) = digits[..3].parse::<u16>()
            {
                return Some(status);
            }

            search_start = after_marker;
        }
    }
    None
}

fn replay_as_events(response: LlmResponse) -> Vec<LlmStreamResponse> {
    let mut events = vec![LlmStreamResponse::MessageStart { usage: None }];
    for (i, block) in response.content.into_iter().enumerate() {
        let index = i as u32;
        match block {
            ContentBlock::Text { text } => {
                events.push(LlmStreamResponse::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text {
                        text: String::new(),
                    },
                });
                events.push(LlmStreamResponse::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::Text { text },
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(LlmStreamResponse::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::json!({}),
                    },
                });
                events.push(LlmStreamResponse::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::ToolUse {
                        partial_json: input.to_string(),
                    },
                });
            }
            ContentBlock::ToolResult { .. } => continue,
        }
        events.push(LlmStreamResponse::ContentBlockStop { index });
    }
    events.push(LlmStreamResponse::MessageStop {
        stop_reason: response.stop_reason,
        usage: response.usage,
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl LlmProvider for Echo {
        fn provider_id(&self) -> &str {
            "echo"
        }

        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(LlmResponse {
                content: vec![ContentBlock::Text {
                    text: "pong".to_string(),
                }],
                model: "echo-1".to_string(),
                usage: Some(Usage {
                    input_tokens: 3,
                    output_tokens: 1,
                }),
                stop_reason: Some("end_turn".to_string()),
            })
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            model: String::new(),
            messages: vec![ChatMessage::user("ping")],
            system: None,
            max_tokens: Some(16),
            temperature: None,
            tools: Vec::new(),
        }
    }

    #[test]
    fn finish_reason_normalizes_vendor_strings() {
        assert_eq!(FinishReason::from_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(FinishReason::from_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(FinishReason::from_stop_reason(Some("length")), FinishReason::Length);
        assert_eq!(FinishReason::from_stop_reason(Some("tool_calls")), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_stop_reason(None), FinishReason::Unknown);
    }

    #[test]
    fn normalize_error_classifies_messages() {
        let err = normalize_error(Error::Agent(
            "openai API error: status=429, body=rate limit".to_string(),
        ));
        assert_eq!(err.code, ProviderErrorCode::RateLimited);
        assert_eq!(err.status, Some(429));

        let err = normalize_error(Error::Agent("request failed: operation timed out".into()));
        assert_eq!(err.code, ProviderErrorCode::Timeout);

        let err = normalize_error(Error::Agent("connection refused".into()));
        assert_eq!(err.code, ProviderErrorCode::Network);

        let err = normalize_error(Error::Agent("something odd".into()));
        assert_eq!(err.code, ProviderErrorCode::Unknown);
    }

    #[tokio::test]
    async fn complete_with_timeout_reports_timeout() {
        let err = complete_with_timeout(&Echo, &request(), Duration::from_millis(5))
            .await
            .expect_err("should time out");
        match err {
            Error::Provider(e) => assert_eq!(e.code, ProviderErrorCode::Timeout),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn default_stream_replays_completion() {
        let mut stream = Echo.stream(&request()).await.unwrap();
        let mut text = String::new();
        let mut stop = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                LlmStreamResponse::ContentBlockDelta {
                    delta: ContentBlockDelta::Text { text: t },
                    ..
                } => text.push_str(&t),
                LlmStreamResponse::MessageStop { stop_reason, .. } => stop = stop_reason,
                _ => {}
            }
        }
        assert_eq!(text, "pong");
        assert_eq!(stop.as_deref(), Some("end_turn"));
    }
}
