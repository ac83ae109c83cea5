// Ambient layer (shared components)
pub mod config;
pub mod encoding;
pub mod error;

// Domain layer
pub mod connection;
pub mod relay;

// Application layer
pub mod server;
pub mod shutdown;

pub use error::{RelayError, Result};
pub use relay::RelayEvent;
pub use server::RelayServer;
