// Tunnel protocol - ControlMessage
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier of a logical connection, unique among the live
/// connections of an endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// The only identifier used in unplexed framing, where the wire carries none.
    pub fn solo() -> Self {
        ConnectionId("solo".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        ConnectionId(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        ConnectionId(s)
    }
}

/// Hands out `conn_1`, `conn_2`, ... and never repeats within a process.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        ConnectionId(format!("conn_{}", n))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Unit of the multiplexing wire protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Connect {
        id: ConnectionId,
        host: String,
        port: u16,
    },
    Connected {
        id: ConnectionId,
    },
    Data {
        id: ConnectionId,
        data: Vec<u8>,
    },
    Closed {
        id: ConnectionId,
    },
    Error {
        id: ConnectionId,
        message: String,
    },
}

impl ControlMessage {
    pub fn id(&self) -> &ConnectionId {
        match self {
            ControlMessage::Connect { id, .. }
            | ControlMessage::Connected { id }
            | ControlMessage::Data { id, .. }
            | ControlMessage::Closed { id }
            | ControlMessage::Error { id, .. } => id,
        }
    }

    /// Wire name of the message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Connect { .. } => "connect",
            ControlMessage::Connected { .. } => "connected",
            ControlMessage::Data { .. } => "data",
            ControlMessage::Closed { .. } => "closed",
            ControlMessage::Error { .. } => "error",
        }
    }
}
