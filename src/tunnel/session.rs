//! Tunnel Session.
//!
//! Drains the transport's event stream, decodes control messages and hands
//! them to the endpoint's role. When the channel closes every logical
//! connection still registered is force-closed.

use chrono::{DateTime, Local};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::TunnelConfig;
use crate::socks5::ingress::Socks5Ingress;
use crate::transport::{Channel, TransportEvent};
use crate::tunnel::codec::Codec;
use crate::tunnel::dialer::RemoteDialer;
use crate::tunnel::protocol::{ConnectionId, ControlMessage};
use crate::tunnel::registry::ConnectionRegistry;
use crate::tunnel::relay::{Outbound, RelaySettings};

/// What this endpoint does with the channel.
pub enum SessionRole {
    /// Serve SOCKS5 clients on an already bound listener once the channel opens.
    Ingress(TcpListener),
    /// Dial destinations on request.
    Dialer,
}

enum Handler {
    Ingress(Socks5Ingress),
    Dialer(RemoteDialer),
}

impl Handler {
    async fn handle(&self, msg: ControlMessage) {
        match self {
            Handler::Ingress(ingress) => ingress.handle(msg).await,
            Handler::Dialer(dialer) => dialer.handle(msg).await,
        }
    }
}

#[derive(Debug)]
pub struct SessionSummary {
    pub opened_at: Option<DateTime<Local>>,
    pub closed_at: DateTime<Local>,
    /// Connections still registered when the channel closed.
    pub force_closed: Vec<ConnectionId>,
    pub messages: u64,
    pub discarded: u64,
}

pub struct TunnelSession {
    registry: ConnectionRegistry,
    codec: Codec,
    handler: Handler,
    listener: Option<TcpListener>,
}

impl TunnelSession {
    pub fn new(config: &TunnelConfig, role: SessionRole, channel: &Channel) -> Self {
        let registry = ConnectionRegistry::new();
        let codec = Codec::new(config.framing);
        let outbound = Outbound::new(codec, channel.outbound.clone());
        let settings = RelaySettings::from(config);
        let (handler, listener) = match role {
            SessionRole::Ingress(listener) => (
                Handler::Ingress(Socks5Ingress::new(registry.clone(), outbound, settings)),
                Some(listener),
            ),
            SessionRole::Dialer => (
                Handler::Dialer(RemoteDialer::new(
                    registry.clone(),
                    outbound,
                    settings,
                    config.allow_loopback,
                )),
                None,
            ),
        };
        Self {
            registry,
            codec,
            handler,
            listener,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run until the transport reports the channel closed.
    pub async fn run(mut self, channel: Channel) -> SessionSummary {
        let Channel {
            outbound,
            mut events,
        } = channel;
        // The handlers hold their own senders.
        drop(outbound);

        let mut opened_at = None;
        let mut accept_task: Option<JoinHandle<()>> = None;
        let mut messages = 0u64;
        let mut discarded = 0u64;

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::State(state) => tracing::info!(?state, "link state"),
                TransportEvent::Open => {
                    if opened_at.is_some() {
                        continue;
                    }
                    opened_at = Some(Local::now());
                    tracing::info!("peer channel open, tunnel ready");
                    if let (Handler::Ingress(ingress), Some(listener)) =
                        (&self.handler, self.listener.take())
                    {
                        if let Ok(addr) = listener.local_addr() {
                            tracing::info!("SOCKS5 proxy listening on {}", addr);
                        }
                        accept_task = Some(tokio::spawn(ingress.clone().serve(listener)));
                    }
                }
                TransportEvent::Message(wire) => {
                    messages += 1;
                    match self.codec.decode(wire) {
                        Ok(msg) => {
                            tracing::debug!(id = %msg.id(), kind = msg.kind(), "received");
                            self.handler.handle(msg).await;
                        }
                        Err(e) => {
                            discarded += 1;
                            tracing::warn!("discarding undecodable message: {}", e);
                        }
                    }
                }
                TransportEvent::Error(e) => tracing::error!("transport error: {}", e),
                TransportEvent::Closed => break,
            }
        }

        if let Some(task) = accept_task {
            task.abort();
        }
        let force_closed = self.registry.drain();
        let closed_at = Local::now();
        let duration = opened_at.map(|start: DateTime<Local>| closed_at - start);
        tracing::info!(
            force_closed = force_closed.len(),
            messages,
            discarded,
            duration_secs = duration.map(|d| d.num_seconds()),
            "peer channel closed, tunnel session ended"
        );

        SessionSummary {
            opened_at,
            closed_at,
            force_closed,
            messages,
            discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WireMessage;
    use crate::tunnel::codec::Framing;
    use crate::tunnel::registry::ConnectionState;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    struct Wiring {
        channel: Channel,
        events: mpsc::Sender<TransportEvent>,
        wire: mpsc::Receiver<WireMessage>,
    }

    fn wiring() -> Wiring {
        let (outbound, wire) = mpsc::channel(64);
        let (events, events_rx) = mpsc::channel(64);
        Wiring {
            channel: Channel {
                outbound,
                events: events_rx,
            },
            events,
            wire,
        }
    }

    /// Greet the front door and request 10.0.0.5:22; returns once the success
    /// reply has arrived.
    async fn socks_client(addr: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0, 22])
            .await
            .unwrap();
        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..4], &[0x05, 0x00, 0x05, 0x00]);
        client
    }

    async fn assert_eof(socket: &mut TcpStream) {
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .expect("socket left open after channel close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    fn dialer_config() -> TunnelConfig {
        TunnelConfig {
            allow_loopback: true,
            ..TunnelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_channel_close_force_closes_open_connections() {
        let config = dialer_config();
        let codec = Codec::new(config.framing);
        let w = wiring();
        let session = TunnelSession::new(&config, SessionRole::Dialer, &w.channel);
        let registry = session.registry().clone();
        let task = tokio::spawn(session.run(w.channel));
        let mut wire = w.wire;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        w.events.send(TransportEvent::Open).await.unwrap();
        for id in ["c1", "c2"] {
            let connect = ControlMessage::Connect {
                id: id.into(),
                host: "127.0.0.1".into(),
                port,
            };
            w.events
                .send(TransportEvent::Message(codec.encode(&connect).unwrap()))
                .await
                .unwrap();
        }

        let (mut s1, _) = listener.accept().await.unwrap();
        let (mut s2, _) = listener.accept().await.unwrap();
        let mut connected = HashSet::new();
        for _ in 0..2 {
            match codec.decode(wire.recv().await.unwrap()).unwrap() {
                ControlMessage::Connected { id } => connected.insert(id),
                other => panic!("unexpected {:?}", other),
            };
        }
        assert_eq!(connected.len(), 2);
        assert_eq!(registry.len(), 2);

        w.events.send(TransportEvent::Closed).await.unwrap();
        let summary = task.await.unwrap();
        assert_eq!(
            summary.force_closed,
            vec![ConnectionId::from("c1"), ConnectionId::from("c2")]
        );

        let mut buf = [0u8; 8];
        for socket in [&mut s1, &mut s2] {
            let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 0);
        }

        // No control message follows the close.
        let rest = tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_messages_are_discarded() {
        let config = TunnelConfig {
            framing: Framing::Multiplexed,
            ..dialer_config()
        };
        let w = wiring();
        let session = TunnelSession::new(&config, SessionRole::Dialer, &w.channel);
        let task = tokio::spawn(session.run(w.channel));

        for wire in [
            WireMessage::Text("{not json".into()),
            WireMessage::Binary(vec![0xde, 0xad]),
            WireMessage::Text(r#"{"type":"closed","id":"nobody"}"#.into()),
        ] {
            w.events.send(TransportEvent::Message(wire)).await.unwrap();
        }
        drop(w.events);

        let summary = task.await.unwrap();
        assert_eq!(summary.messages, 3);
        assert_eq!(summary.discarded, 2);
        assert!(summary.opened_at.is_none());
        assert!(summary.force_closed.is_empty());
    }

    #[tokio::test]
    async fn test_ingress_accepts_only_after_open() {
        let config = TunnelConfig::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = wiring();
        let session = TunnelSession::new(&config, SessionRole::Ingress(listener), &w.channel);
        let task = tokio::spawn(session.run(w.channel));

        w.events.send(TransportEvent::Open).await.unwrap();
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x05, 0x01, 0x00])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        w.events.send(TransportEvent::Closed).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_close_ends_socks_clients() {
        let config = TunnelConfig::default();
        let codec = Codec::new(config.framing);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = wiring();
        let session = TunnelSession::new(&config, SessionRole::Ingress(listener), &w.channel);
        let registry = session.registry().clone();
        let task = tokio::spawn(session.run(w.channel));
        let mut wire = w.wire;

        w.events.send(TransportEvent::Open).await.unwrap();
        let mut first = socks_client(addr).await;
        let mut second = socks_client(addr).await;
        for _ in 0..2 {
            let ControlMessage::Connect { id, .. } =
                codec.decode(wire.recv().await.unwrap()).unwrap()
            else {
                panic!("expected connect");
            };
            let connected = codec.encode(&ControlMessage::Connected { id }).unwrap();
            w.events
                .send(TransportEvent::Message(connected))
                .await
                .unwrap();
        }

        let ids = [ConnectionId::from("conn_1"), ConnectionId::from("conn_2")];
        tokio::time::timeout(Duration::from_secs(5), async {
            while ids
                .iter()
                .any(|id| registry.state(id) != Some(ConnectionState::Open))
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        w.events.send(TransportEvent::Closed).await.unwrap();
        let summary = task.await.unwrap();
        assert_eq!(summary.force_closed, ids.to_vec());

        assert_eof(&mut first).await;
        assert_eof(&mut second).await;

        // Neither client produced a control message on the way out.
        let rest = tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn test_channel_close_drops_clients_mid_handshake() {
        let config = TunnelConfig::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let w = wiring();
        let session = TunnelSession::new(&config, SessionRole::Ingress(listener), &w.channel);
        let registry = session.registry().clone();
        let task = tokio::spawn(session.run(w.channel));
        let mut wire = w.wire;

        w.events.send(TransportEvent::Open).await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        w.events.send(TransportEvent::Closed).await.unwrap();
        task.await.unwrap();

        assert_eof(&mut client).await;
        assert!(registry.is_empty());
        let rest = tokio::time::timeout(Duration::from_secs(5), wire.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
    }
}
