use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nova_agents::{
    ContentBlock, LlmProvider, LlmRequest, LlmResponse, PersistenceSink, SqlitePersistence,
    TurnPipeline,
};
use nova_common::Result;
use nova_config::AppConfig;
use nova_gateway::router::build_router;
use nova_gateway::state::AppState;
use tokio::net::TcpListener;

/// Answers after a pause long enough for the client to give up first.
struct SlowProvider {
    delay: Duration,
}

#[async_trait]
impl LlmProvider for SlowProvider {
    fn provider_id(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(LlmResponse {
            content: vec![ContentBlock::Text {
                text: "Sorry for the wait.".to_string(),
            }],
            model: "slow-1".to_string(),
            usage: None,
            stop_reason: Some("end_turn".to_string()),
        })
    }
}

async fn spawn_gateway(delay: Duration) -> (String, Arc<SqlitePersistence>) {
    let config = AppConfig::default();
    let mut pipeline = TurnPipeline::new(&config);
    pipeline.register_provider(Arc::new(SlowProvider { delay }));
    let persistence = Arc::new(SqlitePersistence::in_memory().unwrap());
    pipeline.set_persistence(persistence.clone());
    let state = Arc::new(AppState::new(config, Arc::new(pipeline)));
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), persistence)
}

fn turn(text: &str) -> serde_json::Value {
    serde_json::json!({
        "text": text,
        "user_context_id": "user-1",
        "conversation_id": "conv-1",
        "session_key": "sess-1",
    })
}

#[tokio::test]
async fn turn_is_persisted_after_client_disconnects() {
    let (addr, persistence) = spawn_gateway(Duration::from_millis(400)).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let sent = client
        .post(format!("http://{addr}/api/turns"))
        .json(&turn("are you still there?"))
        .send()
        .await;
    assert!(sent.is_err(), "client should give up before the reply");

    let mut roles = Vec::new();
    for _ in 0..40 {
        roles = persistence
            .load_history("conv-1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.role, t.text))
            .collect::<Vec<_>>();
        if roles.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(
        roles,
        vec![
            ("user".to_string(), "are you still there?".to_string()),
            ("assistant".to_string(), "Sorry for the wait.".to_string()),
        ]
    );
}

#[tokio::test]
async fn turn_reply_is_returned_to_a_patient_client() {
    let (addr, persistence) = spawn_gateway(Duration::from_millis(20)).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/turns"))
        .json(&turn("hello there"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "replied");
    assert_eq!(body["summary"]["reply"], "Sorry for the wait.");

    let history = persistence.load_history("conv-1", 10).await.unwrap();
    assert_eq!(history.len(), 2);
}
