//! Multiplexed SOCKS5 tunnel over a peer-to-peer message channel.
//!
//! One endpoint runs a SOCKS5 front door and turns every accepted client into a
//! logical connection; the other endpoint dials the requested destinations. All
//! logical connections share a single ordered channel provided by a
//! [`transport::PeerTransport`].

pub mod config;
pub mod connection;
pub mod error;
pub mod socks5;
pub mod transport;
pub mod tunnel;
pub mod utils;
