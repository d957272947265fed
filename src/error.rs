//! Error types shared by the tunnel library.

use thiserror::Error;

use crate::tunnel::protocol::ConnectionId;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Failures of the SOCKS5 front door. Each one tears down only the offending client.
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version: {0}")]
    Version(u8),

    #[error("unsupported command: 0x{0:02x}")]
    Command(u8),

    #[error("unsupported address type: 0x{0:02x}")]
    AddressType(u8),

    #[error("domain name is not valid UTF-8")]
    Domain,

    #[error("tunnel is busy with another connection")]
    Busy,

    #[error("tunnel channel is closed")]
    ChannelClosed,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures to encode or decode a control message.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed binary envelope: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("{kind} message received in {framing} framing")]
    UnexpectedKind {
        kind: &'static str,
        framing: &'static str,
    },

    #[error("message is missing the `{0}` field")]
    MissingField(&'static str),

    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Failures of the peer transport. Any of them ends the tunnel session.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid descriptor: {0}")]
    Descriptor(String),

    #[error("remote descriptor has not been accepted yet")]
    MissingRemote,

    #[error("channel did not open within {0}s")]
    Timeout(u64),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("channel closed")]
    Closed,

    #[error("frame of {0} bytes exceeds the transport limit")]
    FrameTooLarge(usize),
}

/// Top-level error for the tunnel library.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Socks5(#[from] Socks5Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::from(Socks5Error::AddressType(4));
        assert_eq!(err.to_string(), "unsupported address type: 0x04");

        let err = TunnelError::Duplicate(ConnectionId::from("conn_7"));
        assert_eq!(err.to_string(), "connection conn_7 is already registered");
    }

    #[test]
    fn test_codec_error_converts() {
        let err = TunnelError::from(CodecError::MissingField("message"));
        assert!(matches!(err, TunnelError::Codec(_)));
        assert_eq!(err.to_string(), "message is missing the `message` field");
    }
}
