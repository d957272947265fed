//! In-process transport pair.
//!
//! Both endpoints live in the same process and messages are moved through tokio
//! channels. Used by the integration tests and for local demos.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Channel, Descriptor, LinkState, PeerTransport, TransportEvent};

const DESCRIPTOR_PREFIX: &str = "memory:";
const CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    peer_name: String,
    remote_accepted: bool,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    peer_events: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    /// Two linked endpoints. Each must accept the other's descriptor before opening.
    pub fn pair(a: &str, b: &str) -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::channel(CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CAPACITY);
        let left = MemoryTransport {
            name: a.to_string(),
            peer_name: b.to_string(),
            remote_accepted: false,
            events_tx: a_tx.clone(),
            events_rx: a_rx,
            peer_events: b_tx.clone(),
        };
        let right = MemoryTransport {
            name: b.to_string(),
            peer_name: a.to_string(),
            remote_accepted: false,
            events_tx: b_tx,
            events_rx: b_rx,
            peer_events: a_tx,
        };
        (left, right)
    }
}

impl PeerTransport for MemoryTransport {
    fn create_local_descriptor(&self) -> Result<Descriptor, TransportError> {
        Ok(Descriptor::new(format!("{}{}", DESCRIPTOR_PREFIX, self.name)))
    }

    fn accept_remote_descriptor(&mut self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let name = descriptor
            .as_str()
            .strip_prefix(DESCRIPTOR_PREFIX)
            .ok_or_else(|| TransportError::Descriptor(descriptor.to_string()))?;
        if name != self.peer_name {
            return Err(TransportError::Descriptor(format!(
                "{} does not name the linked peer",
                descriptor
            )));
        }
        self.remote_accepted = true;
        Ok(())
    }

    async fn open(self) -> Result<Channel, TransportError> {
        if !self.remote_accepted {
            return Err(TransportError::MissingRemote);
        }

        let (outbound, mut outbound_rx) = mpsc::channel(CAPACITY);
        for event in [TransportEvent::State(LinkState::Connected), TransportEvent::Open] {
            self.events_tx
                .send(event)
                .await
                .map_err(|_| TransportError::Closed)?;
        }

        let peer_events = self.peer_events;
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if peer_events.send(TransportEvent::Message(msg)).await.is_err() {
                    return;
                }
            }
            let _ = peer_events.send(TransportEvent::Closed).await;
        });

        Ok(Channel {
            outbound,
            events: self.events_rx,
        })
    }
}
