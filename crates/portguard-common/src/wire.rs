//! JSON-lines switch channel envelope
//!
//! Each message is one JSON object terminated by `\n`, tagged by `"type"`.
//! A switch must open with [`SwitchMessage::Hello`].

use crate::{
    DatapathId, FlowMod, MeterMod, PacketIn, PacketOut, PortStatsEntry, PortStatsRequest,
    SwitchFeatures,
};
use serde::{Deserialize, Serialize};

/// Message sent by a switch agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwitchMessage {
    /// Session opener carrying identity and capabilities
    Hello {
        /// Switch identifier
        dpid: DatapathId,
        /// Advertised capabilities
        #[serde(default)]
        features: SwitchFeatures,
    },
    /// Frame punted to the controller
    PacketIn(PacketIn),
    /// Counters for the requested ports
    PortStatsReply {
        /// Transaction id of the request
        #[serde(default)]
        xid: u32,
        /// Per-port entries
        body: Vec<PortStatsEntry>,
    },
    /// Keepalive probe
    EchoRequest {
        /// Opaque token echoed back
        #[serde(default)]
        token: u64,
    },
}

/// Message sent by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Flow table mutation
    FlowMod(FlowMod),
    /// Meter table mutation
    MeterMod(MeterMod),
    /// Frame emission
    PacketOut(PacketOut),
    /// Counter request
    PortStatsRequest(PortStatsRequest),
    /// Keepalive answer
    EchoReply {
        /// Token from the request
        token: u64,
    },
}

/// Encode a message as one newline-terminated line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (trailing whitespace ignored)
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}
