use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::TunnelConfig;
use crate::error::{Result, TransportError, TunnelError};
use crate::transport::WireMessage;
use crate::tunnel::codec::Codec;
use crate::tunnel::protocol::{ConnectionId, ControlMessage};
use crate::tunnel::registry::{ConnectionRegistry, ConnectionState, Inbound};

/// Sending half of the shared channel. Every clone feeds the same queue, so
/// wire order is the order in which sends complete.
#[derive(Clone, Debug)]
pub struct Outbound {
    codec: Codec,
    tx: mpsc::Sender<WireMessage>,
}

impl Outbound {
    pub fn new(codec: Codec, tx: mpsc::Sender<WireMessage>) -> Self {
        Self { codec, tx }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub async fn send(&self, msg: ControlMessage) -> Result<()> {
        let wire = self.codec.encode(&msg)?;
        tracing::trace!(id = %msg.id(), kind = msg.kind(), bytes = wire.len(), "send");
        self.tx
            .send(wire)
            .await
            .map_err(|_| TunnelError::Transport(TransportError::Closed))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RelaySettings {
    pub buffer_size: usize,
}

impl From<&TunnelConfig> for RelaySettings {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            buffer_size: config.relay_buffer,
        }
    }
}

/// Why a relay stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEnd {
    /// Local socket reached EOF.
    LocalClosed,
    /// Local socket I/O failed.
    LocalFailed(String),
    /// Peer sent `closed`.
    RemoteClosed,
    /// Peer sent `error`.
    RemoteFailed(String),
    /// Registry entry removed underneath the relay (channel close).
    Cancelled,
    /// The shared channel refused a send.
    ChannelClosed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: u64,
    pub received: u64,
    pub end: RelayEnd,
}

/// Route an event to a live connection without waiting on it. Returns false
/// on a registry miss.
pub fn deliver(registry: &ConnectionRegistry, id: &ConnectionId, inbound: Inbound) -> bool {
    let Some(inbox) = registry.inbox(id) else {
        return false;
    };
    if inbox.send(inbound).is_err() {
        registry.remove(id);
        return false;
    }
    true
}

/// Handle an inbound `closed`/`error`: tell the owning task why, then drop
/// the entry. A no-op returning false when the id is already gone.
pub fn terminate(registry: &ConnectionRegistry, id: &ConnectionId, reason: Inbound) -> bool {
    if !registry.set_state(id, ConnectionState::Closing) {
        return false;
    }
    deliver(registry, id, reason);
    registry.remove(id);
    true
}

/// Relay bytes between a local socket and the shared channel until either
/// side ends the logical connection.
pub async fn relay_connection<S>(
    id: ConnectionId,
    socket: S,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    registry: ConnectionRegistry,
    outbound: Outbound,
    buffer_size: usize,
) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut buf = vec![0u8; buffer_size];
    let mut sent = 0u64;
    let mut received = 0u64;

    let end = loop {
        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break RelayEnd::LocalClosed,
                Err(e) => break RelayEnd::LocalFailed(e.to_string()),
                Ok(n) => {
                    if !registry.contains(&id) {
                        break RelayEnd::Cancelled;
                    }
                    let msg = ControlMessage::Data {
                        id: id.clone(),
                        data: buf[..n].to_vec(),
                    };
                    if outbound.send(msg).await.is_err() {
                        break RelayEnd::ChannelClosed;
                    }
                    sent += n as u64;
                }
            },
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Data(data)) => {
                    if let Err(e) = writer.write_all(&data).await {
                        break RelayEnd::LocalFailed(e.to_string());
                    }
                    received += data.len() as u64;
                }
                Some(Inbound::Connected) => {
                    registry.set_state(&id, ConnectionState::Open);
                }
                Some(Inbound::Closed) => break RelayEnd::RemoteClosed,
                Some(Inbound::Failed(message)) => break RelayEnd::RemoteFailed(message),
                None => break RelayEnd::Cancelled,
            }
        }
    };

    // Only the side that still owns the entry reports the end to the peer.
    let was_live = registry.remove(&id);
    if was_live {
        let notice = match &end {
            RelayEnd::LocalClosed => Some(ControlMessage::Closed { id: id.clone() }),
            RelayEnd::LocalFailed(message) => Some(ControlMessage::Error {
                id: id.clone(),
                message: message.clone(),
            }),
            _ => None,
        };
        if let Some(notice) = notice {
            let _ = outbound.send(notice).await;
        }
    }
    let _ = writer.shutdown().await;

    tracing::info!(%id, sent, received, end = ?end, "connection finished");
    RelayStats {
        sent,
        received,
        end,
    }
}
