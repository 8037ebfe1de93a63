//! Switch protocol messages
//!
//! A transport-neutral subset of OpenFlow 1.3: the flow, meter and packet-out
//! mutations the controller issues, and the packet-in and feature data it
//! receives. Transports map these onto their own framing.

use crate::{MacAddr, PortNo};
use serde::{Deserialize, Serialize};

/// Ethertype of link-layer discovery frames, never learned or forwarded
pub const ETH_TYPE_LLDP: u16 = 0x88cc;

/// Ethertype of IPv4
pub const ETH_TYPE_IPV4: u16 = 0x0800;

/// Output target of an apply-actions instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputPort {
    /// A physical port
    Port(PortNo),
    /// All ports except the ingress port
    Flood,
    /// The switch's non-OpenFlow forwarding pipeline
    Normal,
    /// Send to the controller as a packet-in
    Controller,
}

/// Match fields used by this controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    /// Ingress port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<PortNo>,
    /// Source link-layer address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddr>,
    /// Destination link-layer address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_dst: Option<MacAddr>,
}

impl FlowMatch {
    /// Wildcard match
    pub fn any() -> Self {
        Self::default()
    }

    /// Match every frame entering one port
    pub fn in_port(port: PortNo) -> Self {
        Self {
            in_port: Some(port),
            ..Self::default()
        }
    }

    /// Exact unicast conversation match
    pub fn conversation(port: PortNo, src: MacAddr, dst: MacAddr) -> Self {
        Self {
            in_port: Some(port),
            eth_src: Some(src),
            eth_dst: Some(dst),
        }
    }
}

/// Flow instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    /// Pass the packet through a meter
    Meter(u32),
    /// Apply output actions immediately
    ApplyActions(Vec<OutputPort>),
}

/// Flow table command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowModCommand {
    /// Add or overwrite a rule with identical match and priority
    Add,
    /// Remove the rule with exactly this match and priority
    DeleteStrict,
}

/// Flow table mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    /// Command
    pub command: FlowModCommand,
    /// Table
    #[serde(default)]
    pub table_id: u8,
    /// Priority; higher wins when several rules match
    pub priority: u16,
    /// Match
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    /// Instructions; empty means drop
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    /// Seconds without a hit before the switch removes the rule (0 = never)
    #[serde(default)]
    pub idle_timeout: u16,
    /// Seconds before unconditional removal (0 = never)
    #[serde(default)]
    pub hard_timeout: u16,
}

impl FlowMod {
    /// New add command
    pub fn add(priority: u16, flow_match: FlowMatch, instructions: Vec<Instruction>) -> Self {
        Self {
            command: FlowModCommand::Add,
            table_id: 0,
            priority,
            flow_match,
            instructions,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    /// Strict delete of the rule with this match and priority
    pub fn delete_strict(priority: u16, flow_match: FlowMatch) -> Self {
        Self {
            command: FlowModCommand::DeleteStrict,
            table_id: 0,
            priority,
            flow_match,
            instructions: Vec::new(),
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, secs: u16) -> Self {
        self.idle_timeout = secs;
        self
    }

    /// Rule discards everything it matches
    pub fn is_drop(&self) -> bool {
        self.command == FlowModCommand::Add && self.instructions.is_empty()
    }

    /// Meter referenced by this rule, if any
    pub fn meter_id(&self) -> Option<u32> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Meter(id) => Some(*id),
            _ => None,
        })
    }

    /// Output targets of the apply-actions instruction
    pub fn outputs(&self) -> Vec<OutputPort> {
        self.instructions
            .iter()
            .flat_map(|i| match i {
                Instruction::ApplyActions(out) => out.clone(),
                _ => Vec::new(),
            })
            .collect()
    }
}

/// Meter table command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterModCommand {
    /// Create a meter
    Add,
}

/// Meter table mutation with a single drop band measured in kbps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterMod {
    /// Command
    pub command: MeterModCommand,
    /// Meter identifier
    pub meter_id: u32,
    /// Drop band rate in kbps
    pub rate_kbps: u32,
    /// Drop band burst in kbits
    #[serde(default)]
    pub burst_size: u32,
}

impl MeterMod {
    /// Create a drop-band meter
    pub fn add_drop_band(meter_id: u32, rate_kbps: u32, burst_size: u32) -> Self {
        Self {
            command: MeterModCommand::Add,
            meter_id,
            rate_kbps,
            burst_size,
        }
    }
}

/// Frame delivered to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketIn {
    /// Switch-side buffer holding the frame, if buffered
    #[serde(default)]
    pub buffer_id: Option<u32>,
    /// Ingress port
    pub in_port: PortNo,
    /// Source link-layer address
    pub eth_src: MacAddr,
    /// Destination link-layer address
    pub eth_dst: MacAddr,
    /// Ethertype
    pub eth_type: u16,
    /// Frame bytes (needed when the switch did not buffer the frame)
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Frame emitted by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketOut {
    /// Switch-side buffer to release, if the frame was buffered
    #[serde(default)]
    pub buffer_id: Option<u32>,
    /// Original ingress port
    pub in_port: PortNo,
    /// Output actions
    pub actions: Vec<OutputPort>,
    /// Frame bytes when not buffered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
}

impl PacketOut {
    /// Re-emit a received frame through the given outputs
    pub fn for_packet_in(packet: &PacketIn, actions: Vec<OutputPort>) -> Self {
        Self {
            buffer_id: packet.buffer_id,
            in_port: packet.in_port,
            actions,
            data: if packet.buffer_id.is_none() {
                packet.data.clone()
            } else {
                Vec::new()
            },
        }
    }
}

/// Request counters for ports of a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatsRequest {
    /// Transaction id echoed in the reply
    pub xid: u32,
    /// Port to query; `None` means every port
    #[serde(default)]
    pub port: Option<PortNo>,
}

impl PortStatsRequest {
    /// Query every port
    pub fn all(xid: u32) -> Self {
        Self { xid, port: None }
    }
}

/// Capabilities advertised by a switch at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchFeatures {
    /// Number of flow tables
    #[serde(default = "default_tables")]
    pub n_tables: u8,
    /// Number of physical ports, if reported
    #[serde(default)]
    pub n_ports: Option<u32>,
    /// Switch implements the meter table
    #[serde(default = "default_true")]
    pub supports_meters: bool,
}

fn default_tables() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for SwitchFeatures {
    fn default() -> Self {
        Self {
            n_tables: default_tables(),
            n_ports: None,
            supports_meters: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_rule_detection() {
        let drop = FlowMod::add(400, FlowMatch::in_port(3), vec![]);
        assert!(drop.is_drop());

        let forward = FlowMod::add(
            1,
            FlowMatch::in_port(3),
            vec![Instruction::ApplyActions(vec![OutputPort::Port(2)])],
        );
        assert!(!forward.is_drop());
        assert_eq!(forward.outputs(), vec![OutputPort::Port(2)]);

        let delete = FlowMod::delete_strict(400, FlowMatch::in_port(3));
        assert!(!delete.is_drop());
    }

    #[test]
    fn test_meter_reference() {
        let flow = FlowMod::add(
            300,
            FlowMatch::in_port(7),
            vec![
                Instruction::Meter(1007),
                Instruction::ApplyActions(vec![OutputPort::Normal]),
            ],
        );
        assert_eq!(flow.meter_id(), Some(1007));
    }

    #[test]
    fn test_packet_out_carries_data_only_when_unbuffered() {
        let mut pkt = PacketIn {
            buffer_id: Some(42),
            in_port: 1,
            eth_src: "00:00:00:00:00:01".parse().unwrap(),
            eth_dst: "00:00:00:00:00:02".parse().unwrap(),
            eth_type: ETH_TYPE_IPV4,
            data: vec![1, 2, 3],
        };

        let out = PacketOut::for_packet_in(&pkt, vec![OutputPort::Flood]);
        assert_eq!(out.buffer_id, Some(42));
        assert!(out.data.is_empty());

        pkt.buffer_id = None;
        let out = PacketOut::for_packet_in(&pkt, vec![OutputPort::Flood]);
        assert_eq!(out.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_features_defaults_from_sparse_json() {
        let features: SwitchFeatures = serde_json::from_str("{}").unwrap();
        assert_eq!(features, SwitchFeatures::default());
        assert!(features.supports_meters);
    }
}
