use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use nova_common::{Error, ProviderError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::{
    ChatMessage, ChatRole, ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest, LlmResponse,
    LlmStreamResponse, MessagePart, Usage, map_transport_error,
};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat-completions adapter. Also serves OpenAI-compatible endpoints via `base_url`.
#[derive(Clone)]
pub struct OpenAiProvider {
    id: String,
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            id: "openai".to_string(),
            client: build_client(DEFAULT_TIMEOUT),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| OPENAI_API_URL.to_string()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(timeout);
        self
    }

    fn convert_request(&self, request: &LlmRequest, stream: bool) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage::System {
                content: system.clone(),
            });
        }
        for msg in &request.messages {
            messages.extend(convert_message(msg));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function".to_string(),
                        function: OpenAiFunctionDefinition {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAiRequest {
            model: if request.model.is_empty() {
                self.model.clone()
            } else {
                request.model.clone()
            },
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            stream,
            stream_options: stream.then_some(OpenAiStreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn send(&self, body: &OpenAiRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                format!("openai API error: {body}"),
            )
            .into());
        }
        Ok(response)
    }
}

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// One internal message may fan out into several OpenAI messages
/// (each tool result is its own `tool` message).
fn convert_message(msg: &ChatMessage) -> Vec<OpenAiMessage> {
    match (&msg.role, &msg.content) {
        (ChatRole::System, content) => vec![OpenAiMessage::System {
            content: flatten_text(content),
        }],
        (ChatRole::User, MessagePart::Text(text)) => vec![OpenAiMessage::User {
            content: text.clone(),
        }],
        (ChatRole::Assistant, content) => {
            let mut tool_calls = Vec::new();
            if let MessagePart::Parts(parts) = content {
                for part in parts {
                    if let ContentBlock::ToolUse { id, name, input } = part {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            kind: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        });
                    }
                }
            }
            let text = flatten_text(content);
            vec![OpenAiMessage::Assistant {
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            }]
        }
        (ChatRole::User | ChatRole::Tool, MessagePart::Parts(parts)) => {
            let mut out = Vec::new();
            let mut text = Vec::new();
            for part in parts {
                match part {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(OpenAiMessage::Tool {
                        tool_call_id: tool_use_id.clone(),
                        content: content.clone(),
                    }),
                    ContentBlock::Text { text: t } => text.push(t.clone()),
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text.is_empty() {
                out.push(OpenAiMessage::User {
                    content: text.join("\n"),
                });
            }
            out
        }
        (ChatRole::Tool, MessagePart::Text(text)) => vec![OpenAiMessage::User {
            content: text.clone(),
        }],
    }
}

fn flatten_text(content: &MessagePart) -> String {
    match content {
        MessagePart::Text(t) => t.clone(),
        MessagePart::Parts(parts) => super::extract_text(parts),
    }
}

fn convert_response(response: OpenAiResponse) -> Result<LlmResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::malformed("openai response has no choices"))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        content.push(ContentBlock::Text { text });
    }
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&tc.function.arguments)
            .unwrap_or(serde_json::Value::String(tc.function.arguments.clone()));
        content.push(ContentBlock::ToolUse {
            id: tc.id,
            name: tc.function.name,
            input,
        });
    }

    Ok(LlmResponse {
        content,
        model: response.model,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        stop_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, request), fields(provider = "openai"))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.convert_request(request, false);
        let response = self.send(&body).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("invalid openai JSON: {e}")))?;
        convert_response(parsed)
    }

    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamResponse>>> {
        let body = self.convert_request(request, true);
        let response = self.send(&body).await?;

        let mut initial = VecDeque::new();
        initial.push_back(LlmStreamResponse::MessageStart { usage: None });

        let bytes = response.bytes_stream().boxed();
        let events = stream::try_unfold(
            (bytes, Vec::<u8>::new(), initial),
            |(mut bytes, mut buffer, mut queue): (
                BoxStream<'static, reqwest::Result<Bytes>>,
                Vec<u8>,
                VecDeque<LlmStreamResponse>,
            )| async move {
                loop {
                    if let Some(event) = queue.pop_front() {
                        return Ok(Some((event, (bytes, buffer, queue))));
                    }

                    if let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=i).collect();
                        let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if data == "[DONE]" || data.is_empty() {
                                continue;
                            }
                            let chunk: OpenAiStreamChunk = serde_json::from_str(data).map_err(
                                |e| Error::from(ProviderError::malformed(format!("bad SSE chunk: {e}"))),
                            )?;
                            queue.extend(chunk_events(chunk));
                        }
                        continue;
                    }

                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                        Some(Err(e)) => return Err(map_transport_error(e)),
                        None => return Ok(None),
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        Ok(matches!(response, Ok(resp) if resp.status().is_success()))
    }
}

/// Text lives in block 0; tool call `n` lives in block `n + 1`.
fn chunk_events(chunk: OpenAiStreamChunk) -> Vec<LlmStreamResponse> {
    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            events.push(LlmStreamResponse::ContentBlockDelta {
                index: 0,
                delta: ContentBlockDelta::Text { text },
            });
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index + 1;
            let function = tc.function.unwrap_or_default();
            if let Some(id) = tc.id {
                events.push(LlmStreamResponse::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse {
                        id,
                        name: function.name.clone().unwrap_or_default(),
                        input: serde_json::json!({}),
                    },
                });
            }
            if let Some(arguments) = function.arguments
                && !arguments.is_empty()
            {
                events.push(LlmStreamResponse::ContentBlockDelta {
                    index,
                    delta: ContentBlockDelta::ToolUse {
                        partial_json: arguments,
                    },
                });
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(LlmStreamResponse::MessageStop {
                stop_reason: Some(reason),
                usage: None,
            });
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(LlmStreamResponse::MessageStop {
            stop_reason: None,
            usage: Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }),
        });
    }
    events
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAiStreamOptions>,
}

#[derive(Serialize)]
struct OpenAiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiStreamFunctionCall>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamFunctionCall {
    name: Option<String>,
    arguments: Option<String>,
}
