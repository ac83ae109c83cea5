mod settings;

pub use settings::{RelayConfig, ServerConfig, Settings, ShutdownConfig};
