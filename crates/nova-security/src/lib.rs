pub mod capabilities;
pub mod redaction;

pub use capabilities::CapabilityGate;
pub use redaction::{RedactingWriter, redact_secrets};
