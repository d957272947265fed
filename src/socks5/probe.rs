//! Health probe for a running SOCKS5 front door.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Socks5Error;
use crate::socks5::protocol::{
    NO_AUTH_REPLY, REPLY_SUCCEEDED, SOCKS_ADDR_TYPE_DOMAIN, SOCKS_ADDR_TYPE_IPV4,
    SOCKS_CMD_CONNECT, SOCKS_NO_AUTH, SOCKS_VERSION,
};

#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing is listening.
    NotListening,
    /// Something answered but not with a SOCKS5 no-auth reply.
    UnexpectedReply(Vec<u8>),
    /// Handshake accepted; no CONNECT was attempted.
    HandshakeOk,
    /// CONNECT to the target was answered with success.
    ConnectOk,
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::HandshakeOk | ProbeOutcome::ConnectOk)
    }
}

/// Encode a domain CONNECT request.
pub fn connect_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![
        SOCKS_VERSION,
        SOCKS_CMD_CONNECT,
        0,
        SOCKS_ADDR_TYPE_DOMAIN,
        host.len() as u8,
    ];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// Greet the proxy at `addr` and, with a `target`, ask it to CONNECT there.
pub async fn probe(
    addr: SocketAddr,
    target: Option<(&str, u16)>,
    timeout: Duration,
) -> Result<ProbeOutcome, Socks5Error> {
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Ok(ProbeOutcome::NotListening);
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Ok(ProbeOutcome::NotListening),
    };

    stream
        .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
        .await?;
    let mut method = [0u8; 2];
    read_with_timeout(&mut stream, &mut method, timeout).await?;
    if method != NO_AUTH_REPLY {
        return Ok(ProbeOutcome::UnexpectedReply(method.to_vec()));
    }

    let Some((host, port)) = target else {
        return Ok(ProbeOutcome::HandshakeOk);
    };
    if host.len() > u8::MAX as usize {
        return Err(Socks5Error::Domain);
    }
    stream.write_all(&connect_request(host, port)).await?;
    let mut reply = [0u8; 10];
    read_with_timeout(&mut stream, &mut reply, timeout).await?;
    if reply[..4] == [SOCKS_VERSION, REPLY_SUCCEEDED, 0, SOCKS_ADDR_TYPE_IPV4] {
        Ok(ProbeOutcome::ConnectOk)
    } else {
        Ok(ProbeOutcome::UnexpectedReply(reply.to_vec()))
    }
}

async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), Socks5Error> {
    match tokio::time::timeout(timeout, stream.read_exact(buf)).await {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => Err(Socks5Error::Io(std::io::ErrorKind::TimedOut.into())),
    }
}
