use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nova_agents::{ContentBlock, LlmProvider, LlmRequest, LlmResponse, TurnPipeline};
use nova_common::Result;
use nova_config::AppConfig;
use nova_gateway::router::build_router;
use nova_gateway::state::AppState;
use nova_gateway::ws::MAX_WS_MESSAGE_BYTES;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as TungsteniteMessage;

struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    fn provider_id(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let last = request
            .messages
            .last()
            .map(|m| m.flat_text())
            .unwrap_or_default();
        Ok(LlmResponse {
            content: vec![ContentBlock::Text {
                text: format!("echo: {last}"),
            }],
            model: "echo-1".to_string(),
            usage: None,
            stop_reason: Some("end_turn".to_string()),
        })
    }
}

async fn spawn_gateway() -> String {
    let config = AppConfig::default();
    let pipeline = TurnPipeline::new(&config);
    pipeline.register_provider(Arc::new(EchoProvider));
    let state = Arc::new(AppState::new(config, Arc::new(pipeline)));
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn turn(conversation: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "user_context_id": "user-1",
        "conversation_id": conversation,
        "session_key": format!("sess-{conversation}"),
    })
}

async fn next_json<S>(stream: &mut S) -> serde_json::Value
where
    S: StreamExt<Item = std::result::Result<TungsteniteMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for frame")
        .unwrap()
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn turn_events_are_forwarded_in_order() {
    let addr = spawn_gateway().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "connected");

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/turns"))
        .json(&turn("conv-1", "tell me about otters"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "replied");
    let reply = body["summary"]["reply"].as_str().unwrap().to_string();
    assert_eq!(reply, "echo: tell me about otters");

    let start = next_json(&mut ws).await;
    let delta = next_json(&mut ws).await;
    let done = next_json(&mut ws).await;

    assert_eq!(start["type"], "stream_start");
    assert_eq!(delta["type"], "stream_delta");
    assert_eq!(done["type"], "stream_done");
    assert_eq!(start["stream_id"], done["stream_id"]);
    assert_eq!(start["seq"], 0);
    assert_eq!(done["payload"]["reply"], reply.as_str());
}

#[tokio::test]
async fn duplicate_turn_returns_conflict() {
    let addr = spawn_gateway().await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/turns");

    let first = client.post(&url).json(&turn("conv-2", "hello there friend")).send().await.unwrap();
    let second = client.post(&url).json(&turn("conv-2", "hello there friend")).send().await.unwrap();

    assert_eq!(first.status(), 200);
    assert_eq!(second.status(), 409);
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["status"], "duplicate");
}

#[tokio::test]
async fn conversation_filter_skips_other_conversations() {
    let addr = spawn_gateway().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?conversation_id=conv-b"))
        .await
        .unwrap();
    let _welcome = next_json(&mut ws).await;

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/api/turns");
    client.post(&url).json(&turn("conv-a", "first question")).send().await.unwrap();
    client.post(&url).json(&turn("conv-b", "second question")).send().await.unwrap();

    let start = next_json(&mut ws).await;
    assert_eq!(start["type"], "stream_start");
    assert_eq!(start["conversation_id"], "conv-b");
}

#[tokio::test]
async fn oversized_client_frame_closes_the_socket() {
    let addr = spawn_gateway().await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let _welcome = next_json(&mut ws).await;

    let large = "a".repeat(MAX_WS_MESSAGE_BYTES + 100);
    ws.send(TungsteniteMessage::Text(large.into())).await.unwrap();

    match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.unwrap() {
        Some(Ok(TungsteniteMessage::Close(_))) | Some(Err(_)) | None => {}
        Some(Ok(other)) => panic!("expected connection close, got: {other:?}"),
    }
}
