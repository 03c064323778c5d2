use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use nova_agents::TurnOutcome;
use nova_common::{Error, InboundTurn};
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::ws;

/// Build the main application router with all routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/status", get(status))
        .route("/api/providers", get(list_providers))
        .route("/api/turns", post(submit_turn))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    // Configured LLM backends, keyed by config name.
    let llm: serde_json::Value = state
        .config
        .llm
        .iter()
        .map(|(name, cfg)| {
            let mut info = serde_json::json!({ "provider": cfg.provider });
            if let Some(m) = &cfg.model {
                info["model"] = serde_json::Value::String(m.clone());
            }
            (name.clone(), info)
        })
        .collect::<serde_json::Map<String, serde_json::Value>>()
        .into();

    axum::Json(serde_json::json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "providers": state.pipeline.provider_ids(),
        "default_provider": state.pipeline.default_provider_id(),
        "tools": state.pipeline.tools().names(),
        "ws_subscribers": state.pipeline.events().subscriber_count(),
        "llm": llm,
    }))
}

/// GET /api/providers: registered providers with a live health check.
async fn list_providers(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    let default_id = state.pipeline.default_provider_id();
    let fallbacks = state.pipeline.fallback_provider_ids();

    let providers: Vec<serde_json::Value> = state
        .pipeline
        .health_check_all()
        .await
        .into_iter()
        .map(|(id, healthy)| {
            serde_json::json!({
                "id": id,
                "healthy": healthy,
                "is_default": default_id.as_deref() == Some(id.as_str()),
                "is_fallback": fallbacks.contains(&id),
            })
        })
        .collect();

    axum::Json(serde_json::json!({ "providers": providers }))
}

/// POST /api/turns: run one turn through the pipeline.
async fn submit_turn(
    State(state): State<SharedState>,
    axum::Json(inbound): axum::Json<InboundTurn>,
) -> (StatusCode, axum::Json<serde_json::Value>) {
    // The turn runs on its own task so a client hanging up cannot cancel it
    // half way through persistence.
    let pipeline = Arc::clone(&state.pipeline);
    let handle = tokio::spawn(async move { pipeline.process_turn(inbound).await });
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("turn task failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "status": "error", "error": "turn task failed" })),
            );
        }
    };
    match outcome {
        Ok(TurnOutcome::Replied(summary)) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "status": "replied",
                "summary": summary,
            })),
        ),
        Ok(TurnOutcome::Duplicate {
            turn_id,
            signature,
            first_seen_ms,
        }) => (
            StatusCode::CONFLICT,
            axum::Json(serde_json::json!({
                "status": "duplicate",
                "turn_id": turn_id,
                "signature": signature,
                "first_seen_ms": first_seen_ms,
            })),
        ),
        Err(Error::Agent(message)) => (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "status": "rejected", "error": message })),
        ),
        Err(e) => {
            tracing::error!("turn failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(serde_json::json!({ "status": "error", "error": e.to_string() })),
            )
        }
    }
}
