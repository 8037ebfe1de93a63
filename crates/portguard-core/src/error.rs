//! Error types for the controller core

use crate::policy::Action;
use portguard_common::{ChannelError, DatapathId, PortNo};
use thiserror::Error;

/// Registry lookup failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No live connection for this switch
    #[error("switch {0} is not registered")]
    NotFound(DatapathId),
}

/// Enforcement failure; never fatal, reported by the caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnforceError {
    /// Switch has no live connection; nothing was sent
    #[error("switch {dpid} is not registered")]
    UnregisteredSwitch {
        /// Target switch
        dpid: DatapathId,
    },

    /// The switch channel refused or lost the mutation
    #[error("failed to submit {action} for {dpid}:{port}: {source}")]
    Submission {
        /// Target switch
        dpid: DatapathId,
        /// Target port
        port: PortNo,
        /// Action being enforced
        action: Action,
        /// Channel failure
        #[source]
        source: ChannelError,
    },

    /// Rate limiting requested on a switch without a meter table
    #[error("switch {dpid} does not support meters")]
    MetersUnsupported {
        /// Target switch
        dpid: DatapathId,
    },
}

/// Telemetry sink failure
#[derive(Error, Debug)]
pub enum EventLogError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Invalid controller configuration
#[derive(Error, Debug, Clone, PartialEq)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);
