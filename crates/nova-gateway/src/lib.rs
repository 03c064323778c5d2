pub mod router;
pub mod server;
pub mod state;
pub mod ws;

pub use server::GatewayServer;
pub use state::{AppState, SharedState};
