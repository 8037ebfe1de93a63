//! Port counter records

use crate::{PortNo, StatsError};
use serde::{Deserialize, Serialize};

/// One port entry of a port-stats reply, as received
///
/// Switches are not trusted to fill every field; [`PortStatsEntry::counters`]
/// validates the entry before it reaches the telemetry pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatsEntry {
    /// Port number
    pub port_no: PortNo,
    /// Bytes received
    #[serde(default)]
    pub rx_bytes: Option<u64>,
    /// Bytes transmitted
    #[serde(default)]
    pub tx_bytes: Option<u64>,
    /// Packets received
    #[serde(default)]
    pub rx_packets: Option<u64>,
    /// Packets transmitted
    #[serde(default)]
    pub tx_packets: Option<u64>,
    /// Seconds the port has been alive
    #[serde(default)]
    pub duration_sec: Option<u32>,
}

impl PortStatsEntry {
    /// Fully populated entry
    pub fn new(port_no: PortNo, counters: PortCounters) -> Self {
        Self {
            port_no,
            rx_bytes: Some(counters.rx_bytes),
            tx_bytes: Some(counters.tx_bytes),
            rx_packets: Some(counters.rx_packets),
            tx_packets: Some(counters.tx_packets),
            duration_sec: Some(counters.duration_sec),
        }
    }

    /// Validate the entry. Byte counters are required; packet counters and
    /// duration default to zero.
    pub fn counters(&self) -> Result<PortCounters, StatsError> {
        let rx_bytes = self.rx_bytes.ok_or(StatsError {
            port: self.port_no,
            field: "rx_bytes",
        })?;
        let tx_bytes = self.tx_bytes.ok_or(StatsError {
            port: self.port_no,
            field: "tx_bytes",
        })?;

        Ok(PortCounters {
            rx_bytes,
            tx_bytes,
            rx_packets: self.rx_packets.unwrap_or(0),
            tx_packets: self.tx_packets.unwrap_or(0),
            duration_sec: self.duration_sec.unwrap_or(0),
        })
    }
}

/// Validated counter snapshot for one port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCounters {
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
    /// Packets received
    pub rx_packets: u64,
    /// Packets transmitted
    pub tx_packets: u64,
    /// Seconds the port has been alive
    pub duration_sec: u32,
}

impl PortCounters {
    /// Byte-only snapshot
    pub fn bytes(rx_bytes: u64, tx_bytes: u64) -> Self {
        Self {
            rx_bytes,
            tx_bytes,
            ..Self::default()
        }
    }
}
