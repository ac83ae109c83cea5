//! Per-connection handle and the registry of live connections.

mod handle;
mod id;
mod registry;

pub use handle::ConnectionHandle;
pub use id::{ConnectionId, ConnectionIdAllocator};
pub use registry::{ConnectionRegistry, RegistryStats};
