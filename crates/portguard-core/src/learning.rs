//! Learning switch packet-in path

use crate::config::LearningConfig;
use crate::forwarding::ForwardingTable;
use crate::policy::priority;
use crate::registry::ConnectionRegistry;
use portguard_common::{
    ChannelError, DatapathId, FlowMatch, FlowMod, Instruction, OutputPort, PacketIn, PacketOut,
    PortNo, ETH_TYPE_LLDP,
};
use std::sync::Arc;
use std::time::Duration;

/// What happened to a packet-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketInOutcome {
    /// Link discovery frame, not forwarded
    IgnoredLldp,
    /// Switch is not registered; nothing sent
    Unregistered,
    /// Destination unknown, frame flooded
    Flooded,
    /// Unicast rule installed and frame sent out this port
    Forwarded(PortNo),
}

/// Forwards frames the switch could not match and installs unicast rules
pub struct LearningSwitch {
    registry: Arc<ConnectionRegistry>,
    table: Arc<ForwardingTable>,
    config: LearningConfig,
    op_timeout: Duration,
}

impl LearningSwitch {
    /// Create learning path over a shared table
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        table: Arc<ForwardingTable>,
        config: LearningConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            table,
            config,
            op_timeout,
        }
    }

    /// Learn the source, then forward or flood the frame
    pub async fn handle_packet_in(
        &self,
        dpid: DatapathId,
        packet: PacketIn,
    ) -> Result<PacketInOutcome, ChannelError> {
        if packet.eth_type == ETH_TYPE_LLDP {
            return Ok(PacketInOutcome::IgnoredLldp);
        }

        let Ok(link) = self.registry.handle_for(dpid) else {
            tracing::debug!(%dpid, "packet-in from unregistered switch dropped");
            return Ok(PacketInOutcome::Unregistered);
        };

        self.table.learn(dpid, packet.eth_src, packet.in_port);

        let outcome = match self.table.lookup(dpid, packet.eth_dst) {
            Some(out_port) => {
                let flow = FlowMod::add(
                    priority::LEARNED,
                    FlowMatch::conversation(packet.in_port, packet.eth_src, packet.eth_dst),
                    vec![Instruction::ApplyActions(vec![OutputPort::Port(out_port)])],
                )
                .with_idle_timeout(self.config.flow_idle_timeout_secs);

                self.bounded(dpid, link.handle.send_flow_mod(flow)).await?;
                PacketInOutcome::Forwarded(out_port)
            }
            None => PacketInOutcome::Flooded,
        };

        let output = match outcome {
            PacketInOutcome::Forwarded(port) => OutputPort::Port(port),
            _ => OutputPort::Flood,
        };
        let packet_out = PacketOut::for_packet_in(&packet, vec![output]);
        self.bounded(dpid, link.handle.send_packet_out(packet_out)).await?;

        tracing::debug!(
            %dpid,
            in_port = packet.in_port,
            src = %packet.eth_src,
            dst = %packet.eth_dst,
            ?outcome,
            "packet-in handled"
        );
        Ok(outcome)
    }

    async fn bounded<F>(&self, dpid: DatapathId, send: F) -> Result<(), ChannelError>
    where
        F: std::future::Future<Output = Result<(), ChannelError>>,
    {
        match tokio::time::timeout(self.op_timeout, send).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    %dpid,
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "switch did not accept packet-in response"
                );
                Err(ChannelError::Timeout(self.op_timeout.as_millis() as u64))
            }
        }
    }

    /// Shared forwarding table
    pub fn table(&self) -> &Arc<ForwardingTable> {
        &self.table
    }
}
