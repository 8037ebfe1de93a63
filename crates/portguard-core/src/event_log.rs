//! Telemetry sink
//!
//! One [`StatsRecord`] per raw port sample per poll round, appended whether or
//! not a decision fired.

use crate::error::EventLogError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use portguard_common::{DatapathId, PortCounters, PortNo};
use serde::Serialize;

/// Raw sample as written to the telemetry log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsRecord {
    /// Wall-clock time the reply was received
    pub timestamp: DateTime<Utc>,
    /// Switch
    pub dpid: DatapathId,
    /// Port
    pub port_no: PortNo,
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes transmitted
    pub tx_bytes: u64,
    /// Packets received
    pub rx_packets: u64,
    /// Packets transmitted
    pub tx_packets: u64,
    /// Port lifetime in seconds
    pub duration_sec: u32,
}

impl StatsRecord {
    /// Column names, in row order
    pub const COLUMNS: [&'static str; 8] = [
        "timestamp",
        "dpid",
        "port_no",
        "rx_bytes",
        "tx_bytes",
        "rx_packets",
        "tx_packets",
        "duration_sec",
    ];

    /// Build from validated counters
    pub fn new(
        timestamp: DateTime<Utc>,
        dpid: DatapathId,
        port_no: PortNo,
        counters: &PortCounters,
    ) -> Self {
        Self {
            timestamp,
            dpid,
            port_no,
            rx_bytes: counters.rx_bytes,
            tx_bytes: counters.tx_bytes,
            rx_packets: counters.rx_packets,
            tx_packets: counters.tx_packets,
            duration_sec: counters.duration_sec,
        }
    }

    /// Header line for CSV sinks
    pub fn csv_header() -> String {
        Self::COLUMNS.join(",")
    }

    /// CSV row; the timestamp is Unix seconds with microsecond precision
    pub fn to_csv_row(&self) -> String {
        let ts = self.timestamp.timestamp_micros() as f64 / 1_000_000.0;
        format!(
            "{:.6},{},{},{},{},{},{},{}",
            ts,
            self.dpid,
            self.port_no,
            self.rx_bytes,
            self.tx_bytes,
            self.rx_packets,
            self.tx_packets,
            self.duration_sec
        )
    }
}

/// Append-only sink for raw samples
pub trait EventLog: Send + Sync {
    /// Append one poll round's records
    fn append(&self, records: &[StatsRecord]) -> Result<(), EventLogError>;
}

/// Event log kept in memory
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    records: Mutex<Vec<StatsRecord>>,
}

impl MemoryEventLog {
    /// Create empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far
    pub fn records(&self) -> Vec<StatsRecord> {
        self.records.lock().clone()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Nothing appended yet
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, records: &[StatsRecord]) -> Result<(), EventLogError> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventLog;

impl EventLog for NullEventLog {
    fn append(&self, _records: &[StatsRecord]) -> Result<(), EventLogError> {
        Ok(())
    }
}
