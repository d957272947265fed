use std::io;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::socks5::protocol::is_loopback_address;
use crate::tunnel::protocol::{ConnectionId, ControlMessage};
use crate::tunnel::registry::{ConnectionRegistry, ConnectionState, Inbound};
use crate::tunnel::relay::{Outbound, RelaySettings, deliver, relay_connection, terminate};

pub const LOOP_DETECTED: &str = "loop detected: cannot tunnel to local SOCKS proxy";

/// Remote side of the tunnel: dials destinations requested by `connect`.
#[derive(Clone, Debug)]
pub struct RemoteDialer {
    registry: ConnectionRegistry,
    outbound: Outbound,
    settings: RelaySettings,
    allow_loopback: bool,
}

impl RemoteDialer {
    pub fn new(
        registry: ConnectionRegistry,
        outbound: Outbound,
        settings: RelaySettings,
        allow_loopback: bool,
    ) -> Self {
        Self {
            registry,
            outbound,
            settings,
            allow_loopback,
        }
    }

    pub async fn handle(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Connect { id, host, port } => self.connect(id, host, port).await,
            ControlMessage::Data { id, data } => {
                if !deliver(&self.registry, &id, Inbound::Data(data)) {
                    tracing::debug!(%id, "data for unknown connection dropped");
                }
            }
            ControlMessage::Closed { id } => {
                if terminate(&self.registry, &id, Inbound::Closed) {
                    tracing::debug!(%id, "closed by peer");
                }
            }
            ControlMessage::Error { id, message } => {
                if terminate(&self.registry, &id, Inbound::Failed(message.clone())) {
                    tracing::debug!(%id, %message, "failed on peer");
                }
            }
            ControlMessage::Connected { id } => {
                tracing::warn!(%id, "unexpected `connected` on the dialing side");
            }
        }
    }

    async fn connect(&self, id: ConnectionId, host: String, port: u16) {
        tracing::info!(%id, "OUTGOING {}:{}", host, port);

        // LOOP PREVENTION: never dial back into a local SOCKS proxy
        if !self.allow_loopback && is_loopback_address(&host, port) {
            tracing::warn!(%id, "loop detected, refusing {}:{}", host, port);
            let _ = self
                .outbound
                .send(ControlMessage::Error {
                    id,
                    message: LOOP_DETECTED.to_string(),
                })
                .await;
            return;
        }

        // The entry is reserved while dialing so early data queues in order.
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        if let Err(e) = self
            .registry
            .insert(id.clone(), ConnectionState::Pending, inbox_tx)
        {
            tracing::warn!(%id, "protocol violation, ignoring connect: {}", e);
            return;
        }

        let dialer = self.clone();
        tokio::spawn(async move {
            dialer.dial_and_relay(id, host, port, inbox_rx).await;
        });
    }

    async fn dial_and_relay(
        self,
        id: ConnectionId,
        host: String,
        port: u16,
        inbox: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = dial_error_message(&e);
                tracing::warn!(%id, "failed to connect to {}:{}: {}", host, port, message);
                self.registry.remove(&id);
                let _ = self
                    .outbound
                    .send(ControlMessage::Error { id, message })
                    .await;
                return;
            }
        };

        if !self.registry.set_state(&id, ConnectionState::Open) {
            tracing::debug!(%id, "connection cancelled while dialing");
            return;
        }
        tracing::info!(%id, "CONNECTED {}:{}", host, port);
        if self
            .outbound
            .send(ControlMessage::Connected { id: id.clone() })
            .await
            .is_err()
        {
            self.registry.remove(&id);
            return;
        }

        let _ = stream.set_nodelay(true);
        relay_connection(
            id,
            stream,
            inbox,
            self.registry,
            self.outbound,
            self.settings.buffer_size,
        )
        .await;
    }
}

/// Short, stable description of a dial failure.
pub fn dial_error_message(err: &io::Error) -> String {
    match err.kind() {
        kind @ (io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied) => kind.to_string(),
        _ => err.to_string(),
    }
}
