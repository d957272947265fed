//! SOCKS5 front door.
//!
//! Every accepted client runs its own state machine:
//! `AwaitingGreeting -> AwaitingRequest -> Relaying -> Terminated`. A failure
//! only ever ends the offending client.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::Socks5Error;
use crate::socks5::protocol::{
    NO_AUTH_REPLY, REPLY_GENERAL_FAILURE, REPLY_SUCCEEDED, read_greeting, read_request, reply,
};
use crate::tunnel::protocol::{ConnectionId, ConnectionIds, ControlMessage};
use crate::tunnel::registry::{ConnectionRegistry, ConnectionState, Inbound};
use crate::tunnel::relay::{
    Outbound, RelaySettings, RelayStats, deliver, relay_connection, terminate,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressState {
    AwaitingGreeting,
    AwaitingRequest,
    Relaying(ConnectionId),
    Terminated,
}

#[derive(Clone, Debug)]
pub struct Socks5Ingress {
    registry: ConnectionRegistry,
    outbound: Outbound,
    ids: Arc<ConnectionIds>,
    settings: RelaySettings,
}

impl Socks5Ingress {
    pub fn new(registry: ConnectionRegistry, outbound: Outbound, settings: RelaySettings) -> Self {
        Self {
            registry,
            outbound,
            ids: Arc::new(ConnectionIds::new()),
            settings,
        }
    }

    /// Accept SOCKS5 clients forever, one task per client. The client tasks
    /// belong to this future: dropping or aborting it cancels all of them.
    pub async fn serve(self, listener: TcpListener) {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        let _ = socket.set_nodelay(true);
                        let ingress = self.clone();
                        clients.spawn(async move {
                            if let Err(e) = ingress.handle_client(socket).await {
                                tracing::warn!(client = %addr, "SOCKS error: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("failed to accept SOCKS connection: {}", e),
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }
    }

    /// Drive one client through the handshake and relay its bytes.
    pub async fn handle_client<S>(&self, mut socket: S) -> Result<RelayStats, Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut state = IngressState::AwaitingGreeting;
        tracing::trace!(?state);

        let methods = read_greeting(&mut socket).await?;
        tracing::trace!(?methods, "greeting");
        socket.write_all(&NO_AUTH_REPLY).await?;
        state = IngressState::AwaitingRequest;
        tracing::trace!(?state);

        let request = match read_request(&mut socket).await {
            Ok(request) => request,
            Err(e) => {
                if let Some(code) = e.reply_code() {
                    let _ = socket.write_all(&reply(code)).await;
                }
                return Err(e);
            }
        };

        let id = if self.outbound.codec().framing().is_multiplexed() {
            self.ids.next_id()
        } else {
            ConnectionId::solo()
        };
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        if self
            .registry
            .insert(id.clone(), ConnectionState::Pending, inbox_tx)
            .is_err()
        {
            let _ = socket.write_all(&reply(REPLY_GENERAL_FAILURE)).await;
            return Err(Socks5Error::Busy);
        }

        tracing::info!(%id, "PROXY REQUEST {}:{}", request.host, request.port);
        let connect = ControlMessage::Connect {
            id: id.clone(),
            host: request.host,
            port: request.port,
        };
        if self.outbound.send(connect).await.is_err() {
            self.registry.remove(&id);
            let _ = socket.write_all(&reply(REPLY_GENERAL_FAILURE)).await;
            return Err(Socks5Error::ChannelClosed);
        }

        // Success is reported before the remote dial completes; a later
        // failure can only sever the socket.
        if let Err(e) = socket.write_all(&reply(REPLY_SUCCEEDED)).await {
            if self.registry.remove(&id) {
                let _ = self.outbound.send(ControlMessage::Closed { id }).await;
            }
            return Err(e.into());
        }

        state = IngressState::Relaying(id.clone());
        tracing::trace!(?state);
        let stats = relay_connection(
            id,
            socket,
            inbox_rx,
            self.registry.clone(),
            self.outbound.clone(),
            self.settings.buffer_size,
        )
        .await;

        state = IngressState::Terminated;
        tracing::trace!(?state);
        Ok(stats)
    }

    /// Route a message from the remote endpoint.
    pub async fn handle(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Connected { id } => {
                if deliver(&self.registry, &id, Inbound::Connected) {
                    tracing::info!(%id, "TUNNEL ESTABLISHED");
                } else {
                    tracing::debug!(%id, "`connected` for unknown connection");
                }
            }
            ControlMessage::Data { id, data } => {
                if !deliver(&self.registry, &id, Inbound::Data(data)) {
                    tracing::debug!(%id, "data for unknown connection dropped");
                }
            }
            ControlMessage::Closed { id } => {
                terminate(&self.registry, &id, Inbound::Closed);
            }
            ControlMessage::Error { id, message } => {
                if terminate(&self.registry, &id, Inbound::Failed(message.clone())) {
                    tracing::warn!(%id, "tunnel error: {}", message);
                }
            }
            ControlMessage::Connect { id, .. } => {
                tracing::warn!(%id, "protocol violation: `connect` sent to the SOCKS side");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WireMessage;
    use crate::tunnel::codec::{Codec, Framing};
    use tokio::io::AsyncReadExt;

    fn ingress(framing: Framing) -> (Socks5Ingress, mpsc::Receiver<WireMessage>, Codec) {
        let codec = Codec::new(framing);
        let (tx, rx) = mpsc::channel(64);
        let ingress = Socks5Ingress::new(
            ConnectionRegistry::new(),
            Outbound::new(codec, tx),
            RelaySettings { buffer_size: 1024 },
        );
        (ingress, rx, codec)
    }

    const EXAMPLE_REQUEST: &[u8] = &[
        0x05, 0x01, 0x00, 0x03, 0x0b, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o',
        b'm', 0x00, 0x50,
    ];

    #[tokio::test]
    async fn test_handshake_emits_connect_and_success() {
        let (ingress, mut wire, codec) = ingress(Framing::Multiplexed);
        let (mut client, socket) = tokio::io::duplex(1024);
        let task = {
            let ingress = ingress.clone();
            tokio::spawn(async move { ingress.handle_client(socket).await })
        };

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(EXAMPLE_REQUEST).await.unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..4], &[0x05, 0x00, 0x00, 0x01]);

        let connect = codec.decode(wire.recv().await.unwrap()).unwrap();
        assert_eq!(
            connect,
            ControlMessage::Connect {
                id: "conn_1".into(),
                host: "example.com".into(),
                port: 80,
            }
        );
        assert_eq!(
            ingress.registry.state(&"conn_1".into()),
            Some(ConnectionState::Pending)
        );

        ingress
            .handle(ControlMessage::Connected { id: "conn_1".into() })
            .await;
        ingress
            .handle(ControlMessage::Data {
                id: "conn_1".into(),
                data: b"HTTP/1.1 200 OK".to_vec(),
            })
            .await;
        let mut body = [0u8; 15];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"HTTP/1.1 200 OK");
        assert_eq!(
            ingress.registry.state(&"conn_1".into()),
            Some(ConnectionState::Open)
        );

        ingress
            .handle(ControlMessage::Error {
                id: "conn_1".into(),
                message: "connection reset".into(),
            })
            .await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.received, 15);
        assert!(ingress.registry.is_empty());

        // A late message for the removed id is a no-op.
        ingress
            .handle(ControlMessage::Closed { id: "conn_1".into() })
            .await;
    }

    #[tokio::test]
    async fn test_wrong_version_terminates_without_connect() {
        let (ingress, mut wire, _) = ingress(Framing::Multiplexed);
        let (mut client, socket) = tokio::io::duplex(1024);
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        let err = ingress.handle_client(socket).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Version(4)));
        drop(ingress);
        assert!(wire.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ipv6_request_gets_address_type_reply() {
        let (ingress, _wire, _) = ingress(Framing::Multiplexed);
        let (mut client, socket) = tokio::io::duplex(1024);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x04, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = ingress.handle_client(socket).await.unwrap_err();
        assert!(matches!(err, Socks5Error::AddressType(4)));

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, [0x05, 0x00, 0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(ingress.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unplexed_refuses_second_client() {
        let (ingress, mut wire, codec) = ingress(Framing::Unplexed);

        let (mut first, socket) = tokio::io::duplex(1024);
        let first_task = {
            let ingress = ingress.clone();
            tokio::spawn(async move { ingress.handle_client(socket).await })
        };
        first.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        first.write_all(EXAMPLE_REQUEST).await.unwrap();
        let mut response = [0u8; 12];
        first.read_exact(&mut response).await.unwrap();
        assert_eq!(
            codec.decode(wire.recv().await.unwrap()).unwrap().id(),
            &ConnectionId::solo()
        );

        let (mut second, socket) = tokio::io::duplex(1024);
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        second.write_all(EXAMPLE_REQUEST).await.unwrap();
        let err = ingress.handle_client(socket).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Busy));

        drop(first);
        let stats = first_task.await.unwrap().unwrap();
        assert_eq!(stats.end, crate::tunnel::relay::RelayEnd::LocalClosed);
    }
}
