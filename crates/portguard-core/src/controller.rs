//! Switch event dispatcher
//!
//! Owns every core component and routes [`SwitchEvent`]s from the transport
//! to them. The poll loop runs alongside the event loop; both share the
//! registry, so connect and disconnect are visible to the poller immediately.

use crate::config::ControllerConfig;
use crate::enforcement::EnforcementEngine;
use crate::error::ConfigError;
use crate::event_log::EventLog;
use crate::forwarding::ForwardingTable;
use crate::learning::LearningSwitch;
use crate::policy::{priority, Normalizer, PolicyOracle};
use crate::registry::ConnectionRegistry;
use crate::switch::SharedHandle;
use crate::telemetry::{PollerSettings, TelemetryPoller};
use chrono::{DateTime, Utc};
use portguard_common::{
    AtomicCounter, DatapathId, FlowMatch, FlowMod, Instruction, OutputPort, PacketIn,
    PortStatsEntry, SessionId, SwitchFeatures,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Event tag, for logs and counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Switch completed its handshake
    Connected,
    /// Switch connection closed
    Disconnected,
    /// Frame punted to the controller
    PacketIn,
    /// Counters arrived
    PortStatsReply,
}

/// Everything a switch transport reports to the controller
pub enum SwitchEvent {
    /// Handshake done; `handle` is the outbound channel of this session
    Connected {
        /// Switch
        dpid: DatapathId,
        /// Connection lifetime
        session: SessionId,
        /// Outbound channel
        handle: SharedHandle,
        /// Capabilities
        features: SwitchFeatures,
    },
    /// Connection of `session` closed
    Disconnected {
        /// Switch
        dpid: DatapathId,
        /// Connection lifetime that ended
        session: SessionId,
    },
    /// Frame punted by the table-miss rule
    PacketIn {
        /// Switch
        dpid: DatapathId,
        /// Frame
        packet: PacketIn,
    },
    /// Port counters
    PortStatsReply {
        /// Switch
        dpid: DatapathId,
        /// Per-port entries
        entries: Vec<PortStatsEntry>,
        /// Monotonic receive time
        received_at: Instant,
        /// Wall-clock receive time
        received_wall: DateTime<Utc>,
    },
}

impl SwitchEvent {
    /// Stats reply stamped with the current time
    pub fn stats_reply(dpid: DatapathId, entries: Vec<PortStatsEntry>) -> Self {
        Self::PortStatsReply {
            dpid,
            entries,
            received_at: Instant::now(),
            received_wall: Utc::now(),
        }
    }

    /// Event tag
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::PacketIn { .. } => EventKind::PacketIn,
            Self::PortStatsReply { .. } => EventKind::PortStatsReply,
        }
    }

    /// Switch the event belongs to
    pub fn dpid(&self) -> DatapathId {
        match self {
            Self::Connected { dpid, .. }
            | Self::Disconnected { dpid, .. }
            | Self::PacketIn { dpid, .. }
            | Self::PortStatsReply { dpid, .. } => *dpid,
        }
    }
}

impl std::fmt::Debug for SwitchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchEvent")
            .field("kind", &self.kind())
            .field("dpid", &self.dpid())
            .finish()
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct ControllerStats {
    /// Handshakes completed
    pub connects: AtomicCounter,
    /// Connections closed
    pub disconnects: AtomicCounter,
    /// Packet-ins handled
    pub packet_ins: AtomicCounter,
    /// Packet-ins whose response could not be sent
    pub packet_in_failures: AtomicCounter,
    /// Stats replies received
    pub stats_replies: AtomicCounter,
    /// Switches whose table-miss rule could not be installed
    pub table_miss_failures: AtomicCounter,
}

/// Point-in-time view of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Registered switches
    pub switches: usize,
    /// Active mitigations
    pub mitigations: usize,
    /// Handshakes
    pub connects: u64,
    /// Disconnects
    pub disconnects: u64,
    /// Packet-ins
    pub packet_ins: u64,
    /// Stats replies
    pub stats_replies: u64,
    /// Poll rounds
    pub poll_rounds: u64,
    /// Samples logged
    pub samples: u64,
    /// Malformed samples
    pub malformed_samples: u64,
    /// Counter resets
    pub counter_resets: u64,
    /// Oracle timeouts
    pub oracle_timeouts: u64,
    /// Mitigation flow mutations
    pub flow_mods: u64,
    /// Meter creations
    pub meter_mods: u64,
    /// Failed enforcements
    pub enforcement_failures: u64,
}

/// Match-all rule punting unmatched frames to the controller
pub fn table_miss_rule() -> FlowMod {
    FlowMod::add(
        priority::TABLE_MISS,
        FlowMatch::any(),
        vec![Instruction::ApplyActions(vec![OutputPort::Controller])],
    )
}

/// Controller core
pub struct Controller {
    config: ControllerConfig,
    registry: Arc<ConnectionRegistry>,
    forwarding: Arc<ForwardingTable>,
    learning: LearningSwitch,
    engine: Arc<EnforcementEngine>,
    poller: Arc<TelemetryPoller>,
    stats: ControllerStats,
}

impl Controller {
    /// Wire components and subscribe them to switch eviction
    pub fn new(
        config: ControllerConfig,
        oracle: Arc<dyn PolicyOracle>,
        event_log: Arc<dyn EventLog>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let op_timeout = config.switch_op_timeout();
        let registry = Arc::new(ConnectionRegistry::new());
        let forwarding = Arc::new(ForwardingTable::new());
        let engine = Arc::new(EnforcementEngine::new(
            registry.clone(),
            config.enforcement.clone(),
            op_timeout,
        ));
        let poller = Arc::new(TelemetryPoller::new(
            registry.clone(),
            engine.clone(),
            oracle,
            event_log,
            Normalizer::new(config.normalization.clone()),
            PollerSettings {
                interval: config.poll_interval(),
                op_timeout,
                oracle_budget: config.oracle_budget(),
            },
        ));
        let learning = LearningSwitch::new(
            registry.clone(),
            forwarding.clone(),
            config.learning.clone(),
            op_timeout,
        );

        registry.add_eviction_listener(forwarding.clone());
        registry.add_eviction_listener(engine.clone());
        registry.add_eviction_listener(poller.clone());

        Ok(Self {
            config,
            registry,
            forwarding,
            learning,
            engine,
            poller,
            stats: ControllerStats::default(),
        })
    }

    /// Handle one event to completion
    pub async fn dispatch(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::Connected {
                dpid,
                session,
                handle,
                features,
            } => {
                self.on_connected(dpid, session, handle, features).await;
            }
            SwitchEvent::Disconnected { dpid, session } => {
                self.stats.disconnects.inc();
                self.registry.unregister_session(dpid, session);
            }
            SwitchEvent::PacketIn { dpid, packet } => {
                self.stats.packet_ins.inc();
                if let Err(e) = self.learning.handle_packet_in(dpid, packet).await {
                    self.stats.packet_in_failures.inc();
                    tracing::warn!(%dpid, error = %e, "packet-in response failed");
                }
            }
            SwitchEvent::PortStatsReply {
                dpid,
                entries,
                received_at,
                received_wall,
            } => {
                self.stats.stats_replies.inc();
                self.poller
                    .handle_stats_reply(dpid, entries, received_at, received_wall)
                    .await;
            }
        }
    }

    /// Register, install the table-miss rule, then activate
    async fn on_connected(
        &self,
        dpid: DatapathId,
        session: SessionId,
        handle: SharedHandle,
        features: SwitchFeatures,
    ) -> bool {
        self.stats.connects.inc();
        self.registry.register(dpid, session, handle.clone(), features);

        let timeout = self.config.switch_op_timeout();
        let send = handle.send_flow_mod(table_miss_rule());
        let installed = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(%dpid, %session, error = %e, "failed to install table-miss rule");
                false
            }
            Err(_) => {
                tracing::warn!(
                    %dpid,
                    %session,
                    timeout_ms = timeout.as_millis() as u64,
                    "table-miss rule timed out"
                );
                false
            }
        };

        if !installed {
            // Without the table-miss rule the switch never punts frames.
            self.stats.table_miss_failures.inc();
            self.registry.unregister_session(dpid, session);
            return false;
        }

        let activated = self.registry.activate(dpid, session);
        if activated {
            tracing::info!(%dpid, %session, meters = features.supports_meters, "switch active");
        }
        activated
    }

    /// Consume events until the channel closes or shutdown is signalled.
    ///
    /// Stats replies run on their own tasks so packet-ins are never queued
    /// behind a policy decision.
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<SwitchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut replies = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    tracing::trace!(kind = ?event.kind(), dpid = %event.dpid(), "switch event");

                    if event.kind() == EventKind::PortStatsReply {
                        let controller = self.clone();
                        replies.spawn(async move { controller.dispatch(event).await });
                    } else {
                        self.dispatch(event).await;
                    }
                }
                Some(joined) = replies.join_next(), if !replies.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "stats reply task failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = replies.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "stats reply task failed");
            }
        }
        tracing::info!("event loop stopped");
    }

    /// Run the poll loop and the event loop until shutdown
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Receiver<SwitchEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let poller = tokio::spawn(self.poller.clone().run(shutdown.clone()));

        self.clone().run_events(events, shutdown).await;

        if let Err(e) = poller.await {
            tracing::error!(error = %e, "poller task failed");
        }
    }

    /// Counter snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        let telemetry = self.poller.stats();
        let enforcement = self.engine.stats();

        StatsSnapshot {
            switches: self.registry.len(),
            mitigations: self.engine.mitigations().len(),
            connects: self.stats.connects.get(),
            disconnects: self.stats.disconnects.get(),
            packet_ins: self.stats.packet_ins.get(),
            stats_replies: self.stats.stats_replies.get(),
            poll_rounds: telemetry.rounds.get(),
            samples: telemetry.samples.get(),
            malformed_samples: telemetry.malformed.get(),
            counter_resets: telemetry.counter_resets.get(),
            oracle_timeouts: telemetry.oracle_timeouts.get(),
            flow_mods: enforcement.flow_mods.get(),
            meter_mods: enforcement.meter_mods.get(),
            enforcement_failures: enforcement.failures.get(),
        }
    }

    /// Connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// MAC learning table
    pub fn forwarding(&self) -> &Arc<ForwardingTable> {
        &self.forwarding
    }

    /// Enforcement engine
    pub fn engine(&self) -> &Arc<EnforcementEngine> {
        &self.engine
    }

    /// Telemetry poller
    pub fn poller(&self) -> &Arc<TelemetryPoller> {
        &self.poller
    }

    /// Dispatcher counters
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// Effective configuration
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}
