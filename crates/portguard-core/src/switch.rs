//! Switch connection seam
//!
//! Everything the core sends to a switch goes through [`SwitchHandle`]. The
//! daemon implements it over a TCP channel; [`RecordingSwitch`] implements it
//! in memory for tests and simulation.

use async_trait::async_trait;
use parking_lot::Mutex;
use portguard_common::{ChannelError, FlowMod, MeterMod, PacketOut, PortStatsRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outbound command channel to one connected switch
#[async_trait]
pub trait SwitchHandle: Send + Sync {
    /// Submit a flow table mutation
    async fn send_flow_mod(&self, flow: FlowMod) -> Result<(), ChannelError>;

    /// Submit a meter table mutation
    async fn send_meter_mod(&self, meter: MeterMod) -> Result<(), ChannelError>;

    /// Ask for port counters; the reply arrives as an event
    async fn send_stats_request(&self, request: PortStatsRequest) -> Result<(), ChannelError>;

    /// Emit a frame
    async fn send_packet_out(&self, packet: PacketOut) -> Result<(), ChannelError>;
}

/// Shared handle stored in the registry
pub type SharedHandle = Arc<dyn SwitchHandle>;

/// A message captured by [`RecordingSwitch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Flow mutation
    Flow(FlowMod),
    /// Meter mutation
    Meter(MeterMod),
    /// Stats request
    StatsRequest(PortStatsRequest),
    /// Packet-out
    PacketOut(PacketOut),
}

/// In-memory switch that records every submitted message
#[derive(Debug, Default)]
pub struct RecordingSwitch {
    sent: Mutex<Vec<Mutation>>,
    failing: AtomicBool,
}

impl RecordingSwitch {
    /// Create new recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a recorder already wrapped for the registry
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make subsequent submissions fail with [`ChannelError::Closed`]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<Mutation> {
        self.sent.lock().clone()
    }

    /// Flow mutations sent so far
    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                Mutation::Flow(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    /// Meter mutations sent so far
    pub fn meter_mods(&self) -> Vec<MeterMod> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                Mutation::Meter(meter) => Some(meter.clone()),
                _ => None,
            })
            .collect()
    }

    /// Packet-outs sent so far
    pub fn packet_outs(&self) -> Vec<PacketOut> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                Mutation::PacketOut(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded messages
    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    fn record(&self, mutation: Mutation) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().push(mutation);
        Ok(())
    }
}

#[async_trait]
impl SwitchHandle for RecordingSwitch {
    async fn send_flow_mod(&self, flow: FlowMod) -> Result<(), ChannelError> {
        self.record(Mutation::Flow(flow))
    }

    async fn send_meter_mod(&self, meter: MeterMod) -> Result<(), ChannelError> {
        self.record(Mutation::Meter(meter))
    }

    async fn send_stats_request(&self, request: PortStatsRequest) -> Result<(), ChannelError> {
        self.record(Mutation::StatsRequest(request))
    }

    async fn send_packet_out(&self, packet: PacketOut) -> Result<(), ChannelError> {
        self.record(Mutation::PacketOut(packet))
    }
}
