//! Connection Registry.
//!
//! Maps each live logical connection to the inbox of the task that owns its
//! socket. Removing an entry drops the inbox sender, which tells that task to
//! tear its socket down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, TunnelError};
use crate::tunnel::protocol::ConnectionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Destination requested, not confirmed yet.
    Pending,
    /// Bytes may flow both ways.
    Open,
    /// One side signaled termination. Once closed the entry is removed, so a
    /// closed connection is simply absent from the registry.
    Closing,
}

/// Events routed from the channel to a connection's socket task. Inboxes are
/// unbounded so routing never waits on a single slow socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Connected,
    Data(Vec<u8>),
    Closed,
    Failed(String),
}

#[derive(Debug)]
struct Entry {
    state: ConnectionState,
    inbox: mpsc::UnboundedSender<Inbound>,
}

/// Cloneable handle; all clones share one table.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<ConnectionId, Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        id: ConnectionId,
        state: ConnectionState,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(TunnelError::Duplicate(id));
        }
        entries.insert(id, Entry { state, inbox });
        Ok(())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.entries.lock().get(id).map(|entry| entry.state)
    }

    /// Returns false if the connection is not registered.
    pub fn set_state(&self, id: &ConnectionId, state: ConnectionState) -> bool {
        match self.entries.lock().get_mut(id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Sender for routing to the connection, cloned out of the lock.
    pub fn inbox(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.entries.lock().get(id).map(|entry| entry.inbox.clone())
    }

    /// Idempotent. Returns whether an entry was removed.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Removes every entry, cancelling all their tasks. Returns the removed ids.
    pub fn drain(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.entries.lock().drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
