pub mod memory_store;
pub mod transcript_store;

pub use memory_store::{MemoryEntry, MemoryRole, MemoryStore, NewMemoryEntry};
pub use transcript_store::{DeliveryKey, TranscriptStore, TranscriptTurn, UsageTotals};
