//! portguard common - shared types for the port-mitigation controller
//!
//! This crate provides the vocabulary shared by the controller core and the
//! daemon:
//! - Switch and session identifiers
//! - Link-layer addresses and per-port keys
//! - Switch protocol messages (flow, meter, packet-out, port stats)
//! - The JSON-lines wire envelope
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod openflow;
pub mod stats;
pub mod wire;

pub use error::*;
pub use openflow::*;
pub use stats::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Datapath (switch) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatapathId(pub u64);

impl DatapathId {
    /// Raw identifier value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatapathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for DatapathId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Switch port number
pub type PortNo = u32;

/// Identifies one connection lifetime of a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Allocate a process-unique session id
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// (switch, port) key used by every per-port map
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortKey {
    /// Switch
    pub dpid: DatapathId,
    /// Port on that switch
    pub port: PortNo,
}

impl PortKey {
    /// Create new key
    pub const fn new(dpid: DatapathId, port: PortNo) -> Self {
        Self { dpid, port }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dpid, self.port)
    }
}

/// 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// ff:ff:ff:ff:ff:ff
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// Raw octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Group (multicast or broadcast) address
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

/// Lock-free counter for controller statistics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "00:1B:44:11:3a:b7".parse().unwrap();
        assert_eq!(mac.octets(), [0x00, 0x1b, 0x44, 0x11, 0x3a, 0xb7]);
        assert_eq!(mac.to_string(), "00:1b:44:11:3a:b7");

        let dashed: MacAddr = "00-1b-44-11-3a-b7".parse().unwrap();
        assert_eq!(dashed, mac);
    }

    #[test]
    fn test_mac_rejects_malformed() {
        assert!("00:1b:44:11:3a".parse::<MacAddr>().is_err());
        assert!("00:1b:44:11:3a:b7:01".parse::<MacAddr>().is_err());
        assert!("00:1b:44:11:3a:zz".parse::<MacAddr>().is_err());
        assert!("001b:44:11:3a:b7".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_multicast_bit() {
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!("01:00:5e:00:00:fb".parse::<MacAddr>().unwrap().is_multicast());
        assert!(!"02:00:00:00:00:01".parse::<MacAddr>().unwrap().is_multicast());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_atomic_counter() {
        let counter = AtomicCounter::new(0);
        assert_eq!(counter.inc(), 0);
        assert_eq!(counter.add(5), 1);
        assert_eq!(counter.get(), 6);
    }
}
