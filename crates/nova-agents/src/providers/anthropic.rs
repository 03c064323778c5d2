use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use nova_common::{ProviderError, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

use super::{
    ChatMessage, ChatRole, ContentBlock, ContentBlockDelta, LlmProvider, LlmRequest, LlmResponse,
    LlmStreamResponse, MessagePart, Usage, map_transport_error,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AnthropicProvider {
    id: String,
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            id: "anthropic".to_string(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            client: build_client(DEFAULT_TIMEOUT),
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Register under a different id, e.g. the config entry name.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
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

    fn build_body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        let model = if request.model.is_empty() {
            self.model.as_str()
        } else {
            request.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "messages": request.messages.iter().map(to_wire_message).collect::<Vec<_>>(),
            "max_tokens": request.max_tokens.unwrap_or(1024),
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    }))
                    .collect::<Vec<_>>()
            );
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                format!("anthropic API error: {body}"),
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

fn to_wire_message(msg: &ChatMessage) -> serde_json::Value {
    // Anthropic carries tool results in user turns; system text goes in `system`.
    let role = match msg.role {
        ChatRole::Assistant => "assistant",
        ChatRole::User | ChatRole::Tool | ChatRole::System => "user",
    };
    let content = match &msg.content {
        MessagePart::Text(text) => json!(text),
        MessagePart::Parts(parts) => json!(
            parts
                .iter()
                .map(|part| match part {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::ToolUse { id, name, input } => json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect::<Vec<_>>()
        ),
    };
    json!({ "role": role, "content": content })
}

fn parse_usage(value: &serde_json::Value) -> Option<Usage> {
    value.as_object().map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
    })
}

fn parse_response(raw: &serde_json::Value) -> Result<LlmResponse> {
    let blocks = raw["content"]
        .as_array()
        .ok_or_else(|| ProviderError::malformed("anthropic response missing content"))?;

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block["type"].as_str().unwrap_or_default() {
            "text" => content.push(ContentBlock::Text {
                text: block["text"].as_str().unwrap_or_default().to_string(),
            }),
            "tool_use" => content.push(ContentBlock::ToolUse {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                input: block["input"].clone(),
            }),
            other => debug!(block_type = other, "skipping unsupported anthropic content block"),
        }
    }

    Ok(LlmResponse {
        content,
        model: raw["model"].as_str().unwrap_or_default().to_string(),
        usage: parse_usage(&raw["usage"]),
        stop_reason: raw["stop_reason"].as_str().map(str::to_string),
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self, request), fields(provider = "anthropic"))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = self.build_body(request, false);
        let response = self.send(&body).await?;
        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("invalid anthropic JSON: {e}")))?;
        parse_response(&raw)
    }

    async fn stream(
        &self,
        request: &LlmRequest,
    ) -> Result<BoxStream<'static, Result<LlmStreamResponse>>> {
        let body = self.build_body(request, true);
        let response = self.send(&body).await?;

        let bytes = response.bytes_stream().boxed();
        let events = stream::try_unfold(
            (bytes, Vec::<u8>::new()),
            |(mut bytes, mut buffer): (BoxStream<'static, reqwest::Result<Bytes>>, Vec<u8>)| async move {
                loop {
                    if let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buffer.drain(0..=i).collect();
                        let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                        if let Some(data) = line.strip_prefix("data: ")
                            && let Ok(value) = serde_json::from_str::<serde_json::Value>(data)
                            && let Some(event) = parse_stream_event(&value)
                        {
                            return Ok(Some((event, (bytes, buffer))));
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
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}]
        });
        Ok(self.send(&body).await.is_ok())
    }
}

fn parse_stream_event(value: &serde_json::Value) -> Option<LlmStreamResponse> {
    let index = value["index"].as_u64().unwrap_or(0) as u32;
    match value["type"].as_str().unwrap_or_default() {
        "message_start" => Some(LlmStreamResponse::MessageStart {
            usage: parse_usage(&value["message"]["usage"]),
        }),
        "content_block_start" => {
            let block = &value["content_block"];
            let content_block = match block["type"].as_str().unwrap_or_default() {
                "text" => ContentBlock::Text {
                    text: block["text"].as_str().unwrap_or_default().to_string(),
                },
                "tool_use" => ContentBlock::ToolUse {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    input: json!({}),
                },
                _ => return None,
            };
            Some(LlmStreamResponse::ContentBlockStart {
                index,
                content_block,
            })
        }
        "content_block_delta" => {
            let delta = &value["delta"];
            let delta = match delta["type"].as_str().unwrap_or_default() {
                "text_delta" => ContentBlockDelta::Text {
                    text: delta["text"].as_str().unwrap_or_default().to_string(),
                },
                "input_json_delta" => ContentBlockDelta::ToolUse {
                    partial_json: delta["partial_json"].as_str().unwrap_or_default().to_string(),
                },
                _ => return None,
            };
            Some(LlmStreamResponse::ContentBlockDelta { index, delta })
        }
        "content_block_stop" => Some(LlmStreamResponse::ContentBlockStop { index }),
        "message_delta" => Some(LlmStreamResponse::MessageStop {
            stop_reason: value["delta"]["stop_reason"].as_str().map(str::to_string),
            usage: value["usage"]["output_tokens"].as_u64().map(|tokens| Usage {
                input_tokens: 0,
                output_tokens: tokens as u32,
            }),
        }),
        "ping" => Some(LlmStreamResponse::Ping),
        _ => None,
    }
}
