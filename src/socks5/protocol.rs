//! SOCKS5 protocol constants and request parsing.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Socks5Error;

pub const SOCKS_VERSION: u8 = 5;
pub const SOCKS_ADDR_TYPE_IPV4: u8 = 1;
pub const SOCKS_ADDR_TYPE_DOMAIN: u8 = 3;
pub const SOCKS_ADDR_TYPE_IPV6: u8 = 4;
pub const SOCKS_CMD_CONNECT: u8 = 1;
pub const SOCKS_NO_AUTH: u8 = 0;

pub const REPLY_SUCCEEDED: u8 = 0;
pub const REPLY_GENERAL_FAILURE: u8 = 1;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 7;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 8;

/// Method selection reply; no authentication is ever negotiated.
pub const NO_AUTH_REPLY: [u8; 2] = [SOCKS_VERSION, SOCKS_NO_AUTH];

/// Destination parsed from a CONNECT request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Request reply with an all-zero IPv4 bound address.
pub fn reply(code: u8) -> [u8; 10] {
    [SOCKS_VERSION, code, 0, SOCKS_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]
}

impl Socks5Error {
    /// Reply code to send before closing, if the client should get one.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Socks5Error::Command(_) => Some(REPLY_COMMAND_NOT_SUPPORTED),
            Socks5Error::AddressType(_) => Some(REPLY_ADDRESS_TYPE_NOT_SUPPORTED),
            Socks5Error::Domain | Socks5Error::Busy | Socks5Error::ChannelClosed => {
                Some(REPLY_GENERAL_FAILURE)
            }
            Socks5Error::Version(_) | Socks5Error::Io(_) => None,
        }
    }
}

/// Read the method-selection greeting. Returns the offered methods, which are
/// ignored.
pub async fn read_greeting<R>(reader: &mut R) -> Result<Vec<u8>, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(buf[0]));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    reader.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Read a CONNECT request for an IPv4 or domain-name destination.
pub async fn read_request<R>(reader: &mut R) -> Result<ConnectRequest, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(buf[0]));
    }
    if buf[1] != SOCKS_CMD_CONNECT {
        return Err(Socks5Error::Command(buf[1]));
    }

    let host = match buf[3] {
        SOCKS_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            reader.read_exact(&mut addr).await?;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        SOCKS_ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| Socks5Error::Domain)?
        }
        other => return Err(Socks5Error::AddressType(other)),
    };

    let mut port_buf = [0u8; 2];
    reader.read_exact(&mut port_buf).await?;
    Ok(ConnectRequest {
        host,
        port: u16::from_be_bytes(port_buf),
    })
}

/// Ports a SOCKS proxy on the dialing machine usually listens on.
pub const LOCAL_PROXY_PORTS: [u16; 3] = [1080, 1081, 9050];

/// Whether `host:port` names a SOCKS proxy on this machine. Dialing one would
/// feed the tunnel back into itself.
pub fn is_loopback_address(host: &str, port: u16) -> bool {
    if !LOCAL_PROXY_PORTS.contains(&port) {
        return false;
    }
    host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
