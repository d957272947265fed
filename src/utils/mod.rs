pub mod logging;
pub mod signaling;
