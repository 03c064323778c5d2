use std::sync::Arc;

use async_trait::async_trait;
use nova_common::{Error, Result};
use nova_db::DeliveryKey;
use serde_json::json;
use tracing::{info, warn};

use crate::ledger::{ClaimStatus, IdempotencyLedger};
use crate::persistence::PersistenceSink;
use crate::tools::{Tool, ToolContext, ToolOutput};

const LEDGER_SCOPE: &str = "report";

/// Posts a generated report into the current conversation, at most once per
/// idempotency key and at most once per mission output.
pub struct DeliverReport {
    ledger: Arc<IdempotencyLedger>,
    sink: Arc<dyn PersistenceSink>,
}

impl DeliverReport {
    pub fn new(ledger: Arc<IdempotencyLedger>, sink: Arc<dyn PersistenceSink>) -> Self {
        Self { ledger, sink }
    }

    async fn deliver(
        &self,
        context: &ToolContext,
        title: &str,
        body: &str,
        delivery: Option<&DeliveryKey>,
    ) -> Result<String> {
        let conversation_id = context.conversation_id.as_str();

        if let Some(key) = delivery
            && let Some(existing) = self.sink.delivered_message_id(key).await?
        {
            return Ok(existing);
        }

        let message_id = self
            .sink
            .append_transcript_turn(
                conversation_id,
                "assistant",
                &format!("{title}\n\n{body}"),
                json!({ "kind": "report", "turn_id": context.turn_id }),
            )
            .await?;

        if let Some(key) = delivery
            && !self
                .sink
                .record_delivery(key, conversation_id, Some(&message_id))
                .await?
        {
            warn!(node_id = %key.node_id, "delivery raced with another writer");
        }

        Ok(message_id)
    }
}

fn delivery_key(args: &serde_json::Value) -> Result<Option<DeliveryKey>> {
    let run_id = args["mission_run_id"].as_str();
    let run_key = args["run_key"].as_str();
    let node_id = args["node_id"].as_str();

    match (run_id, run_key, node_id) {
        (None, None, None) => Ok(None),
        (Some(run_id), Some(run_key), Some(node_id)) => {
            let output_index = args["output_index"].as_u64().unwrap_or(0);
            let output_index = u32::try_from(output_index)
                .map_err(|_| Error::Tool("output_index is out of range".to_string()))?;
            Ok(Some(DeliveryKey {
                mission_run_id: run_id.to_string(),
                run_key: run_key.to_string(),
                node_id: node_id.to_string(),
                output_index,
            }))
        }
        _ => Err(Error::Tool(
            "mission_run_id, run_key and node_id must be provided together".to_string(),
        )),
    }
}

#[async_trait]
impl Tool for DeliverReport {
    fn name(&self) -> &'static str {
        "deliver_report"
    }

    fn description(&self) -> &'static str {
        "Post a finished report into the current conversation. Always pass a stable \
         idempotency_key so a retried call does not post the report twice."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "idempotency_key": {
                    "type": "string",
                    "description": "Stable key for this delivery. Repeated calls with the same key are no-ops."
                },
                "title": { "type": "string" },
                "body": { "type": "string" },
                "mission_run_id": { "type": "string" },
                "run_key": { "type": "string" },
                "node_id": { "type": "string" },
                "output_index": { "type": "integer", "minimum": 0 }
            },
            "required": ["idempotency_key", "title", "body"]
        })
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["conversation.write"]
    }

    fn is_side_effecting(&self) -> bool {
        true
    }

    async fn execute(&self, context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let key = args["idempotency_key"]
            .as_str()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::Tool("missing or invalid 'idempotency_key' argument".to_string()))?;
        let title = args["title"]
            .as_str()
            .ok_or_else(|| Error::Tool("missing or invalid 'title' argument".to_string()))?;
        let body = args["body"]
            .as_str()
            .ok_or_else(|| Error::Tool("missing or invalid 'body' argument".to_string()))?;
        let delivery = delivery_key(&args)?;

        let user = context.user_context_id.as_str();
        let claim = self.ledger.claim(key, user, LEDGER_SCOPE, None);
        if !claim.accepted {
            info!(key, status = ?claim.status, "report already claimed");
            let status = match claim.status {
                ClaimStatus::Pending => "pending",
                ClaimStatus::Completed => "completed",
                ClaimStatus::Failed => "failed",
            };
            return Ok(ToolOutput::success(
                json!({
                    "delivered": false,
                    "duplicate": true,
                    "status": status,
                    "message_id": claim.result_ref,
                })
                .to_string(),
            ));
        }

        match self.deliver(context, title, body, delivery.as_ref()).await {
            Ok(message_id) => {
                self.ledger.complete(
                    key,
                    user,
                    LEDGER_SCOPE,
                    ClaimStatus::Completed,
                    Some(message_id.clone()),
                );
                info!(key, message_id = %message_id, "report delivered");
                Ok(ToolOutput::success(
                    json!({ "delivered": true, "duplicate": false, "message_id": message_id })
                        .to_string(),
                ))
            }
            Err(e) => {
                self.ledger
                    .complete(key, user, LEDGER_SCOPE, ClaimStatus::Failed, None);
                Err(e)
            }
        }
    }
}
