use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use nova_common::{ConversationId, Turn, UserContextId};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    StreamStart,
    StreamDelta,
    StreamDone,
}

/// One event on a turn's reply stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    pub stream_id: String,
    pub conversation_id: ConversationId,
    pub user_context_id: UserContextId,
    /// Position within the stream, starting at 0 for `stream_start`.
    pub seq: u64,
    pub payload: serde_json::Value,
}

/// Fan-out channel for lifecycle events. Publishing never blocks; a slow
/// subscriber lags and misses events instead of stalling the pipeline.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Open a writer for a turn's reply stream. The stream id is the turn id.
    pub fn writer_for(&self, turn: &Turn) -> StreamWriter {
        StreamWriter {
            bus: self.clone(),
            stream_id: turn.turn_id.clone(),
            conversation_id: turn.conversation_id.clone(),
            user_context_id: turn.user_context_id.clone(),
            seq: 0,
            deltas: 0,
            state: WriterState::Idle,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Open,
    Closed,
}

/// Emits `stream_start → stream_delta* → stream_done` for one stream id.
///
/// Out-of-order calls are absorbed: a delta or done on an idle writer opens
/// the stream first, and anything after done is dropped.
pub struct StreamWriter {
    bus: EventBus,
    stream_id: String,
    conversation_id: ConversationId,
    user_context_id: UserContextId,
    seq: u64,
    deltas: u64,
    state: WriterState,
}

impl StreamWriter {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// Whether any text has gone out on this stream.
    pub fn has_deltas(&self) -> bool {
        self.deltas > 0
    }

    pub fn start(&mut self, payload: serde_json::Value) {
        if self.state != WriterState::Idle {
            return;
        }
        self.emit(LifecycleKind::StreamStart, payload);
        self.state = WriterState::Open;
    }

    pub fn delta(&mut self, text: &str) {
        if text.is_empty() || self.state == WriterState::Closed {
            return;
        }
        self.start(serde_json::json!({}));
        self.emit(LifecycleKind::StreamDelta, serde_json::json!({ "text": text }));
        self.deltas += 1;
    }

    pub fn done(&mut self, payload: serde_json::Value) {
        if self.state == WriterState::Closed {
            return;
        }
        self.start(serde_json::json!({}));
        self.emit(LifecycleKind::StreamDone, payload);
        self.state = WriterState::Closed;
    }

    fn emit(&mut self, kind: LifecycleKind, payload: serde_json::Value) {
        trace!(stream_id = %self.stream_id, ?kind, seq = self.seq, "lifecycle event");
        self.bus.publish(LifecycleEvent {
            kind,
            stream_id: self.stream_id.clone(),
            conversation_id: self.conversation_id.clone(),
            user_context_id: self.user_context_id.clone(),
            seq: self.seq,
            payload,
        });
        self.seq += 1;
    }
}
