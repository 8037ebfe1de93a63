//! Per-switch MAC learning table

use crate::registry::EvictionListener;
use dashmap::DashMap;
use portguard_common::{DatapathId, MacAddr, PortNo};
use std::collections::HashMap;

/// MAC → port table for every switch.
///
/// Last writer wins and entries never age out; the table is bounded by the
/// addresses actually seen and is cleared when the switch disconnects.
#[derive(Debug, Default)]
pub struct ForwardingTable {
    tables: DashMap<DatapathId, HashMap<MacAddr, PortNo>>,
}

impl ForwardingTable {
    /// Create empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `mac` was seen on `in_port`. Returns the port it moved from.
    pub fn learn(&self, dpid: DatapathId, mac: MacAddr, in_port: PortNo) -> Option<PortNo> {
        let previous = self.tables.entry(dpid).or_default().insert(mac, in_port);

        if let Some(old) = previous.filter(|old| *old != in_port) {
            tracing::debug!(%dpid, %mac, from = old, to = in_port, "station moved");
        }
        previous
    }

    /// Port for `mac`, or `None` when unknown (caller floods)
    #[inline]
    pub fn lookup(&self, dpid: DatapathId, mac: MacAddr) -> Option<PortNo> {
        self.tables.get(&dpid).and_then(|t| t.get(&mac).copied())
    }

    /// Number of stations learned on a switch
    pub fn len(&self, dpid: DatapathId) -> usize {
        self.tables.get(&dpid).map(|t| t.len()).unwrap_or(0)
    }

    /// Drop everything learned on a switch
    pub fn forget_switch(&self, dpid: DatapathId) {
        if let Some((_, table)) = self.tables.remove(&dpid) {
            tracing::debug!(%dpid, stations = table.len(), "forwarding table cleared");
        }
    }
}

impl EvictionListener for ForwardingTable {
    fn evict_switch(&self, dpid: DatapathId) {
        self.forget_switch(dpid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_learn_then_lookup() {
        let table = ForwardingTable::new();
        let sw = DatapathId(1);
        let a = mac("00:00:00:00:00:0a");

        assert_eq!(table.lookup(sw, a), None);
        assert_eq!(table.learn(sw, a, 1), None);
        assert_eq!(table.lookup(sw, a), Some(1));
    }

    #[test]
    fn test_last_writer_wins() {
        let table = ForwardingTable::new();
        let sw = DatapathId(1);
        let a = mac("00:00:00:00:00:0a");

        table.learn(sw, a, 1);
        assert_eq!(table.learn(sw, a, 4), Some(1));
        assert_eq!(table.lookup(sw, a), Some(4));
        assert_eq!(table.len(sw), 1);
    }

    #[test]
    fn test_tables_are_per_switch() {
        let table = ForwardingTable::new();
        let a = mac("00:00:00:00:00:0a");

        table.learn(DatapathId(1), a, 1);
        assert_eq!(table.lookup(DatapathId(2), a), None);
    }

    #[test]
    fn test_eviction_clears_switch() {
        let table = ForwardingTable::new();
        let a = mac("00:00:00:00:00:0a");
        table.learn(DatapathId(1), a, 1);
        table.learn(DatapathId(2), a, 3);

        table.evict_switch(DatapathId(1));
        assert_eq!(table.lookup(DatapathId(1), a), None);
        assert_eq!(table.lookup(DatapathId(2), a), Some(3));
    }
}
