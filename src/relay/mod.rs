//! Fan-out of received text to every connection except its sender.

mod dispatcher;

pub use dispatcher::{RelayDispatcher, RelayStats, RelayStatsSnapshot};

use crate::connection::ConnectionId;

/// One relayed message: a decoded chunk of text and the connection it
/// came from. The payload is an owned copy, never a view into a shared
/// read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub sender_id: ConnectionId,
    pub text: String,
}

impl RelayEvent {
    pub fn new(sender_id: ConnectionId, text: impl Into<String>) -> Self {
        Self {
            sender_id,
            text: text.into(),
        }
    }
}
