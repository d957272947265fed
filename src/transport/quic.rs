//! Peer transport over an iroh QUIC connection.
//!
//! The descriptor is the endpoint id. The answering endpoint dials the offering
//! one, opens a single bidirectional stream and writes a one-byte preamble so
//! the stream becomes visible to the acceptor. Every message on the stream is
//! framed as `kind:u8 | len:u32 BE | bytes`.

use std::time::Duration;

use ::iroh::endpoint::{Connection, Endpoint, RecvStream, SendStream};
use ::iroh::{PublicKey, SecretKey};
use tokio::sync::mpsc;

use crate::connection::logger::log_connection_details;
use crate::error::TransportError;
use crate::transport::{
    Channel, Descriptor, LinkState, PeerTransport, TransportEvent, WireMessage,
};

pub const TUNNEL_ALPN: &[u8] = b"peer-socks-tunnel/1";

const PREAMBLE: u8 = 0x50;
const FRAME_TEXT: u8 = 0;
const FRAME_BINARY: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 5;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const DIAL_BASE_DELAY: Duration = Duration::from_secs(1);
const DIAL_MAX_DELAY: Duration = Duration::from_secs(8);

type Established = (Connection, SendStream, RecvStream);

/// Which half of the descriptor exchange this endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Publishes its descriptor first and waits for the peer to dial in.
    Offer,
    /// Consumes the offer and dials it.
    Answer,
}

pub struct IrohTransport {
    endpoint: Endpoint,
    role: Role,
    remote: Option<PublicKey>,
    connect_timeout: Duration,
    capacity: usize,
}

impl IrohTransport {
    pub async fn bind(
        secret_key: SecretKey,
        role: Role,
        connect_timeout: Duration,
        capacity: usize,
    ) -> Result<Self, TransportError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![TUNNEL_ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| TransportError::Connect(format!("failed to bind endpoint: {}", e)))?;

        tracing::info!(endpoint_id = %endpoint.id(), ?role, "iroh endpoint bound");

        Ok(Self {
            endpoint,
            role,
            remote: None,
            connect_timeout,
            capacity,
        })
    }

    async fn establish(&self, remote: PublicKey) -> Result<Established, TransportError> {
        match self.role {
            Role::Answer => {
                // The offering operator may still be pasting our descriptor;
                // keep dialing with backoff until the open timeout fires.
                let mut attempts = 0u32;
                loop {
                    match self.dial(remote).await {
                        Ok(established) => return Ok(established),
                        Err(e) => {
                            let delay = (DIAL_BASE_DELAY * 2_u32.pow(attempts.min(3)))
                                .min(DIAL_MAX_DELAY);
                            attempts += 1;
                            tracing::warn!(
                                "dial attempt #{} failed: {}; retrying in {:?}",
                                attempts,
                                e,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
            Role::Offer => self.accept_peer(remote).await,
        }
    }

    async fn dial(&self, remote: PublicKey) -> Result<Established, TransportError> {
        tracing::info!(peer = %remote, "dialing offering endpoint");
        let conn = self
            .endpoint
            .connect(remote, TUNNEL_ALPN)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        send.write_all(&[PREAMBLE])
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok((conn, send, recv))
    }

    async fn accept_peer(&self, remote: PublicKey) -> Result<Established, TransportError> {
        tracing::info!(peer = %remote, "waiting for answering endpoint");
        loop {
            let incoming = self.endpoint.accept().await.ok_or(TransportError::Closed)?;
            let connecting = match incoming.accept() {
                Ok(connecting) => connecting,
                Err(e) => {
                    tracing::warn!("failed to accept connection: {}", e);
                    continue;
                }
            };
            let conn = match connecting.await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("connection error: {}", e);
                    continue;
                }
            };
            let peer = conn.remote_id();
            if peer != remote {
                tracing::warn!(%peer, "refusing connection from unexpected peer");
                conn.close(1u32.into(), b"unexpected peer");
                continue;
            }
            let (send, mut recv) = conn
                .accept_bi()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let mut preamble = [0u8; 1];
            recv.read_exact(&mut preamble)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            if preamble[0] != PREAMBLE {
                return Err(TransportError::Connect(format!(
                    "unexpected preamble 0x{:02x}",
                    preamble[0]
                )));
            }
            return Ok((conn, send, recv));
        }
    }
}

impl PeerTransport for IrohTransport {
    fn create_local_descriptor(&self) -> Result<Descriptor, TransportError> {
        Ok(Descriptor::new(self.endpoint.id().to_string()))
    }

    fn accept_remote_descriptor(&mut self, descriptor: &Descriptor) -> Result<(), TransportError> {
        let peer: PublicKey = descriptor
            .as_str()
            .parse()
            .map_err(|e| TransportError::Descriptor(format!("{}: {}", descriptor, e)))?;
        if peer == self.endpoint.id() {
            return Err(TransportError::Descriptor(
                "remote descriptor is this endpoint's own id".into(),
            ));
        }
        self.remote = Some(peer);
        Ok(())
    }

    async fn open(self) -> Result<Channel, TransportError> {
        let remote = self.remote.ok_or(TransportError::MissingRemote)?;
        let (events_tx, events) = mpsc::channel(self.capacity.max(4));
        let _ = events_tx
            .send(TransportEvent::State(LinkState::Connecting))
            .await;

        let (conn, send, recv) =
            match tokio::time::timeout(self.connect_timeout, self.establish(remote)).await {
                Ok(Ok(established)) => established,
                Ok(Err(e)) => {
                    tracing::error!(state = ?LinkState::Failed, "peer channel failed: {}", e);
                    return Err(e);
                }
                Err(_) => {
                    tracing::error!(state = ?LinkState::Failed, "peer channel timed out");
                    return Err(TransportError::Timeout(self.connect_timeout.as_secs()));
                }
            };

        log_connection_details(&self.endpoint, conn.remote_id(), "peer channel open");
        let _ = events_tx
            .send(TransportEvent::State(LinkState::Connected))
            .await;
        let _ = events_tx.send(TransportEvent::Open).await;

        let (outbound, outbound_rx) = mpsc::channel(self.capacity);
        tokio::spawn(write_loop(send, outbound_rx, events_tx.clone(), conn.clone()));
        tokio::spawn(read_loop(recv, events_tx, conn, self.endpoint));

        Ok(Channel { outbound, events })
    }
}

pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>, TransportError> {
    let (kind, bytes) = match msg {
        WireMessage::Text(text) => (FRAME_TEXT, text.as_bytes()),
        WireMessage::Binary(bytes) => (FRAME_BINARY, bytes.as_slice()),
    };
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
    frame.push(kind);
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
    Ok(frame)
}

/// Returns the frame kind and body length.
pub fn decode_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(u8, usize), TransportError> {
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok((header[0], len))
}

pub fn decode_body(kind: u8, body: Vec<u8>) -> Result<WireMessage, String> {
    match kind {
        FRAME_TEXT => String::from_utf8(body)
            .map(WireMessage::Text)
            .map_err(|e| format!("text frame is not UTF-8: {}", e)),
        FRAME_BINARY => Ok(WireMessage::Binary(body)),
        other => Err(format!("unknown frame kind 0x{:02x}", other)),
    }
}

async fn write_loop(
    mut send: SendStream,
    mut rx: mpsc::Receiver<WireMessage>,
    events: mpsc::Sender<TransportEvent>,
    conn: Connection,
) {
    while let Some(msg) = rx.recv().await {
        let frame = match encode_frame(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping outbound message: {}", e);
                continue;
            }
        };
        if let Err(e) = send.write_all(&frame).await {
            tracing::error!("channel write failed: {}", e);
            let _ = events.send(TransportEvent::Error(e.to_string())).await;
            // Ends the read loop, which reports the close.
            conn.close(1u32.into(), b"write failed");
            return;
        }
    }
    let _ = send.finish();
}

async fn read_loop(
    mut recv: RecvStream,
    events: mpsc::Sender<TransportEvent>,
    conn: Connection,
    // Keeps the endpoint alive for as long as the channel is read.
    _endpoint: Endpoint,
) {
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        if let Err(e) = recv.read_exact(&mut header).await {
            tracing::debug!("channel read ended: {}", e);
            break;
        }
        let (kind, len) = match decode_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        };
        let mut body = vec![0u8; len];
        if let Err(e) = recv.read_exact(&mut body).await {
            tracing::debug!("channel read ended mid-frame: {}", e);
            break;
        }
        match decode_body(kind, body) {
            Ok(msg) => {
                if events.send(TransportEvent::Message(msg)).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("discarding frame: {}", e),
        }
    }

    conn.close(0u32.into(), b"tunnel closed");
    let _ = events.send(TransportEvent::Closed).await;
}
