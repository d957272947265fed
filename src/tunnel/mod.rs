// Tunnel protocol implementation
pub mod codec;
pub mod dialer;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
