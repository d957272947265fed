//! Peer transport capability.
//!
//! The tunnel does not care how the channel between the two endpoints is
//! established. A transport only has to produce a local descriptor, accept the
//! remote one, and then open an ordered, reliable message channel whose
//! lifecycle is reported as a stream of [`TransportEvent`]s.

pub mod quic;
pub mod memory;

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Opaque connection-negotiation payload moved between operators out of band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor(String);

impl Descriptor {
    pub fn new(value: impl Into<String>) -> Self {
        Descriptor(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Descriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let descriptor = Descriptor::new(s);
        if descriptor.0.is_empty() {
            return Err(TransportError::Descriptor("empty descriptor".into()));
        }
        Ok(descriptor)
    }
}

/// A message as carried by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Text(_) => "text",
            WireMessage::Binary(_) => "binary",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Connectivity of the underlying link. Reported for observability only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    State(LinkState),
    /// The channel is usable; relaying may start.
    Open,
    Message(WireMessage),
    Error(String),
    /// The channel is gone. No further events follow.
    Closed,
}

/// An open channel. Every send of a tunnel session goes through `outbound`,
/// so the wire order is exactly the order of sends.
#[derive(Debug)]
pub struct Channel {
    pub outbound: mpsc::Sender<WireMessage>,
    pub events: mpsc::Receiver<TransportEvent>,
}

pub trait PeerTransport: Send {
    /// Descriptor the remote operator needs to reach this endpoint.
    fn create_local_descriptor(&self) -> Result<Descriptor, TransportError>;

    /// Record the descriptor produced by the remote endpoint.
    fn accept_remote_descriptor(&mut self, descriptor: &Descriptor) -> Result<(), TransportError>;

    /// Establish the channel. Fails if it cannot be opened at all.
    fn open(self) -> impl Future<Output = Result<Channel, TransportError>> + Send;
}
