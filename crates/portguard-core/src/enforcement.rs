//! Enforcement engine
//!
//! Turns a policy [`Action`] into flow and meter mutations on the switch that
//! owns the port, and keeps the per-port [`Mitigation`] record.
//!
//! Per port the engine moves `NONE → X` on a decision and `X → Y` when a new
//! decision supersedes the old one. Switch-side idle expiry is not observed, so
//! records are eventually consistent with the switch, not synchronized.

use crate::config::EnforcementConfig;
use crate::error::EnforceError;
use crate::policy::Action;
use crate::registry::{ConnectionRegistry, EvictionListener, SwitchLink};
use dashmap::{DashMap, DashSet};
use portguard_common::{
    AtomicCounter, ChannelError, DatapathId, FlowMatch, FlowMod, Instruction, MeterMod,
    OutputPort, PortKey, PortNo,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a mitigation leaves the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Switch removes the rule after this long without a matching packet
    IdleTimeout(Duration),
}

/// Currently enforced treatment of a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mitigation {
    /// Enforced action (never NOOP)
    pub action: Action,
    /// When the rule was last (re)installed
    pub installed_at: Instant,
    /// Expiry
    pub expiry: ExpiryPolicy,
    /// Meter referenced by the rule
    pub meter_id: Option<u32>,
}

impl Mitigation {
    /// Whether the switch may already have expired the rule. Traffic keeps
    /// idle rules alive, so `false` is certain and `true` is only a hint.
    pub fn may_have_expired(&self, now: Instant) -> bool {
        match self.expiry {
            ExpiryPolicy::IdleTimeout(idle) => {
                now.saturating_duration_since(self.installed_at) >= idle
            }
        }
    }
}

/// Successful enforcement outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// NOOP: nothing sent, existing mitigation untouched
    Unchanged,
    /// Rule installed; `superseded` is the action it replaced, if different
    Installed {
        /// Replaced action
        superseded: Option<Action>,
    },
}

/// Enforcement counters
#[derive(Debug, Default)]
pub struct EnforcementStats {
    /// Flow mutations accepted by switches
    pub flow_mods: AtomicCounter,
    /// Meter creations accepted by switches
    pub meter_mods: AtomicCounter,
    /// Superseded rules withdrawn
    pub withdrawals: AtomicCounter,
    /// Failed enforcements
    pub failures: AtomicCounter,
}

/// Maps actions to switch mutations
pub struct EnforcementEngine {
    registry: Arc<ConnectionRegistry>,
    config: EnforcementConfig,
    op_timeout: Duration,
    mitigations: DashMap<PortKey, Mitigation>,
    meters: DashSet<(DatapathId, u32)>,
    stats: EnforcementStats,
}

impl EnforcementEngine {
    /// Create engine bound to a registry
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        config: EnforcementConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            config,
            op_timeout,
            mitigations: DashMap::new(),
            meters: DashSet::new(),
            stats: EnforcementStats::default(),
        }
    }

    /// Meter id for a port
    #[inline]
    pub fn meter_id(&self, port: PortNo) -> u32 {
        self.config.meter_id_base.wrapping_add(port)
    }

    /// Apply `action` to ingress traffic of `port` on `dpid`
    pub async fn enforce(
        &self,
        dpid: DatapathId,
        port: PortNo,
        action: Action,
    ) -> Result<Enforcement, EnforceError> {
        let link = self
            .registry
            .handle_for(dpid)
            .map_err(|_| EnforceError::UnregisteredSwitch { dpid })?;

        let result = self.enforce_on(&link, port, action).await;
        if result.is_err() {
            self.stats.failures.inc();
        }
        result
    }

    async fn enforce_on(
        &self,
        link: &SwitchLink,
        port: PortNo,
        action: Action,
    ) -> Result<Enforcement, EnforceError> {
        let dpid = link.dpid;
        let key = PortKey::new(dpid, port);

        let flow = match action {
            Action::Noop => return Ok(Enforcement::Unchanged),
            Action::RateLimit => {
                if !link.features.supports_meters {
                    return Err(EnforceError::MetersUnsupported { dpid });
                }
                let meter_id = self.ensure_meter(link, port).await?;
                self.rate_limit_flow(port, meter_id)
            }
            Action::Drop => self.drop_flow(port),
            Action::Reroute => self.reroute_flow(port),
        };

        let previous = self.mitigations.get(&key).map(|m| m.action);

        self.ensure_current(link)?;
        self.submit(link.handle.send_flow_mod(flow))
            .await
            .map_err(|source| EnforceError::Submission {
                dpid,
                port,
                action,
                source,
            })?;
        self.stats.flow_mods.inc();

        let superseded = previous.filter(|prev| *prev != action);
        if let Some(prev) = superseded {
            if self.config.withdraw_superseded {
                self.ensure_current(link)?;
                self.withdraw(link, port, prev).await;
            }
        }

        // A disconnect during submission already evicted this switch.
        self.ensure_current(link)?;

        self.mitigations.insert(
            key,
            Mitigation {
                action,
                installed_at: Instant::now(),
                expiry: ExpiryPolicy::IdleTimeout(Duration::from_secs(
                    self.config.idle_timeout_secs as u64,
                )),
                meter_id: (action == Action::RateLimit).then(|| self.meter_id(port)),
            },
        );

        match superseded {
            Some(prev) => {
                tracing::info!(%dpid, port, %action, superseded = %prev, "mitigation replaced")
            }
            None => tracing::info!(
                %dpid,
                port,
                %action,
                idle_timeout = self.config.idle_timeout_secs,
                "mitigation installed"
            ),
        }

        Ok(Enforcement::Installed { superseded })
    }

    /// Create the port's meter unless this switch already has it
    async fn ensure_meter(&self, link: &SwitchLink, port: PortNo) -> Result<u32, EnforceError> {
        let meter_id = self.meter_id(port);
        let key = (link.dpid, meter_id);

        // Reserve first so concurrent decisions for the port issue one create.
        if !self.meters.insert(key) {
            return Ok(meter_id);
        }

        // An eviction that ran before the insert left nothing to clear it.
        if let Err(e) = self.ensure_current(link) {
            self.meters.remove(&key);
            return Err(e);
        }

        let meter = MeterMod::add_drop_band(
            meter_id,
            self.config.meter_rate_kbps,
            self.config.meter_burst_kbps,
        );
        if let Err(source) = self.submit(link.handle.send_meter_mod(meter)).await {
            self.meters.remove(&key);
            return Err(EnforceError::Submission {
                dpid: link.dpid,
                port,
                action: Action::RateLimit,
                source,
            });
        }

        self.stats.meter_mods.inc();
        tracing::info!(
            dpid = %link.dpid,
            meter_id,
            rate_kbps = self.config.meter_rate_kbps,
            "meter created"
        );
        Ok(meter_id)
    }

    /// Fail unless `link` is still the switch's registered session
    fn ensure_current(&self, link: &SwitchLink) -> Result<(), EnforceError> {
        if self.registry.is_current(link.dpid, link.session) {
            Ok(())
        } else {
            Err(EnforceError::UnregisteredSwitch { dpid: link.dpid })
        }
    }

    async fn withdraw(&self, link: &SwitchLink, port: PortNo, action: Action) {
        let Some(priority) = action.priority() else {
            return;
        };

        let delete = FlowMod::delete_strict(priority, FlowMatch::in_port(port));
        match self.submit(link.handle.send_flow_mod(delete)).await {
            Ok(()) => {
                self.stats.withdrawals.inc();
            }
            Err(e) => {
                // The old rule still expires on its idle timeout.
                tracing::warn!(
                    dpid = %link.dpid,
                    port,
                    %action,
                    error = %e,
                    "failed to withdraw superseded rule"
                );
            }
        }
    }

    async fn submit<F>(&self, send: F) -> Result<(), ChannelError>
    where
        F: Future<Output = Result<(), ChannelError>>,
    {
        match tokio::time::timeout(self.op_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.op_timeout.as_millis() as u64)),
        }
    }

    fn rate_limit_flow(&self, port: PortNo, meter_id: u32) -> FlowMod {
        FlowMod::add(
            crate::policy::priority::RATE_LIMIT,
            FlowMatch::in_port(port),
            vec![
                Instruction::Meter(meter_id),
                Instruction::ApplyActions(vec![OutputPort::Normal]),
            ],
        )
        .with_idle_timeout(self.config.idle_timeout_secs)
    }

    fn drop_flow(&self, port: PortNo) -> FlowMod {
        FlowMod::add(crate::policy::priority::DROP, FlowMatch::in_port(port), Vec::new())
            .with_idle_timeout(self.config.idle_timeout_secs)
    }

    // TODO: replace the flood with a computed alternate path once topology discovery lands.
    fn reroute_flow(&self, port: PortNo) -> FlowMod {
        FlowMod::add(
            crate::policy::priority::REROUTE,
            FlowMatch::in_port(port),
            vec![Instruction::ApplyActions(vec![OutputPort::Flood])],
        )
        .with_idle_timeout(self.config.idle_timeout_secs)
    }

    /// Current mitigation of a port
    pub fn mitigation(&self, dpid: DatapathId, port: PortNo) -> Option<Mitigation> {
        self.mitigations.get(&PortKey::new(dpid, port)).map(|m| m.clone())
    }

    /// All current mitigations
    pub fn mitigations(&self) -> Vec<(PortKey, Mitigation)> {
        self.mitigations
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Whether the meter for `port` has been created on `dpid`
    pub fn has_meter(&self, dpid: DatapathId, port: PortNo) -> bool {
        self.meters.contains(&(dpid, self.meter_id(port)))
    }

    /// Counters
    pub fn stats(&self) -> &EnforcementStats {
        &self.stats
    }
}

impl EvictionListener for EnforcementEngine {
    fn evict_switch(&self, dpid: DatapathId) {
        self.mitigations.retain(|key, _| key.dpid != dpid);
        self.meters.retain(|(meter_dpid, _)| *meter_dpid != dpid);
    }
}
