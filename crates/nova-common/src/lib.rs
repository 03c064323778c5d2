pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, ProviderError, ProviderErrorCode, Result};
pub use message::{InboundTurn, Turn, TurnHints, TurnSource, clean_text, stable_digest};
pub use types::{ConversationId, SessionKey, UserContextId};
