//! Error types shared across portguard crates

use thiserror::Error;

/// Failure to deliver a message over a switch channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Connection to the switch is gone
    #[error("switch channel closed")]
    Closed,

    /// Switch did not accept the message within the operation timeout
    #[error("switch channel timed out after {0} ms")]
    Timeout(u64),
}

/// A port-stats entry lacking a required counter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed port stats for port {port}: missing {field}")]
pub struct StatsError {
    /// Port the entry claimed to describe
    pub port: u32,
    /// First missing required field
    pub field: &'static str,
}

/// Unparsable link-layer address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid MAC address: {0}")]
pub struct ParseMacError(pub String);
