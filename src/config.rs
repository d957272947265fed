//! Runtime configuration shared by both tunnel endpoints.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TunnelError};
pub use crate::tunnel::codec::Framing;

/// Default SOCKS5 listen port.
pub const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Bytes read from a socket per `data` message.
pub const DEFAULT_RELAY_BUFFER: usize = 16 * 1024;

/// Capacity of the shared outbound channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// Address the SOCKS5 front door listens on (ingress side only).
    pub socks_addr: SocketAddr,
    pub framing: Framing,
    pub relay_buffer: usize,
    pub channel_capacity: usize,
    /// How long the transport may take to open the channel.
    pub connect_timeout: Duration,
    /// Allow the dialer to reach loopback SOCKS ports.
    pub allow_loopback: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            socks_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_SOCKS_PORT)),
            framing: Framing::Multiplexed,
            relay_buffer: DEFAULT_RELAY_BUFFER,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: Duration::from_secs(60),
            allow_loopback: false,
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.relay_buffer == 0 {
            return Err(TunnelError::config("relay buffer must be non-zero"));
        }
        if self.channel_capacity == 0 {
            return Err(TunnelError::config("channel capacity must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(TunnelError::config("connect timeout must be non-zero"));
        }
        Ok(())
    }
}
