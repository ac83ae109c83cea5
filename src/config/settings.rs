use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::encoding::TextEncoding;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port 0 requests an OS-assigned ephemeral port (used by the tests).
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum bytes per read; each read of up to this size is relayed
    /// as one discrete message (no framing).
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Capacity of each connection's outbound channel. Sends are
    /// fire-and-forget: when the channel is full the chunk is dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Capacity of the inbound event channel feeding the dispatcher.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
    /// Wire text encoding.
    #[serde(default)]
    pub encoding: TextEncoding,
    /// Whether handles are removed from the registry when their receive
    /// loop ends. Off by default: disposed handles stay registered, a
    /// known limitation carried over from the original design.
    #[serde(default)]
    pub remove_on_disconnect: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds to wait for a connection's tasks to end before aborting them.
    #[serde(default = "default_join_timeout")]
    pub join_timeout_seconds: u64,
    /// Maximum connections disposed concurrently during shutdown.
    #[serde(default = "default_max_concurrent_disposals")]
    pub max_concurrent_disposals: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7400
}

fn default_read_chunk_size() -> usize {
    256
}

fn default_outbound_buffer() -> usize {
    32
}

fn default_inbound_buffer() -> usize {
    256
}

fn default_join_timeout() -> u64 {
    5
}

fn default_max_concurrent_disposals() -> usize {
    64
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 7400i64)?
            .set_default("relay.read_chunk_size", 256i64)?
            .set_default("relay.outbound_buffer", 32i64)?
            .set_default("relay.inbound_buffer", 256i64)?
            .set_default("shutdown.join_timeout_seconds", 5i64)?
            .set_default("shutdown.max_concurrent_disposals", 64i64)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, etc.
            .add_source(Environment::default().separator("_").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl ShutdownConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: default_read_chunk_size(),
            outbound_buffer: default_outbound_buffer(),
            inbound_buffer: default_inbound_buffer(),
            encoding: TextEncoding::default(),
            remove_on_disconnect: false,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            join_timeout_seconds: default_join_timeout(),
            max_concurrent_disposals: default_max_concurrent_disposals(),
        }
    }
}
