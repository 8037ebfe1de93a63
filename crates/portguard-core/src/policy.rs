//! Policy decision interface
//!
//! The controller consumes decisions through [`PolicyOracle`] only. Trained
//! models live outside this crate and plug in by implementing the trait over
//! [`Observation::to_features`]; [`ThresholdPolicy`] is the deterministic
//! reference implementation.

use crate::config::NormalizationConfig;
use crate::error::ConfigError;
use async_trait::async_trait;
use portguard_common::{DatapathId, PortNo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Flow priorities. Mitigations always outrank ordinary forwarding for the
/// same ingress port.
pub mod priority {
    /// Match-all rule sending unmatched frames to the controller
    pub const TABLE_MISS: u16 = 0;
    /// Unicast rules installed by the learning switch
    pub const LEARNED: u16 = 1;
    /// Reroute (flood) mitigation
    pub const REROUTE: u16 = 200;
    /// Metered mitigation
    pub const RATE_LIMIT: u16 = 300;
    /// Discard mitigation
    pub const DROP: u16 = 400;
}

/// Enforcement decision for one port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Action {
    /// Leave the port alone
    Noop = 0,
    /// Pass ingress traffic through a meter
    RateLimit = 1,
    /// Discard ingress traffic
    Drop = 2,
    /// Flood ingress traffic instead of the normal path (placeholder for path selection)
    Reroute = 3,
}

impl Action {
    /// Every action, in id order
    pub const ALL: [Action; 4] = [Action::Noop, Action::RateLimit, Action::Drop, Action::Reroute];

    /// Wire id used by external policies
    pub fn id(&self) -> u8 {
        *self as u8
    }

    /// Priority of the rule realizing this action; `None` for NOOP
    pub fn priority(&self) -> Option<u16> {
        match self {
            Self::Noop => None,
            Self::RateLimit => Some(priority::RATE_LIMIT),
            Self::Drop => Some(priority::DROP),
            Self::Reroute => Some(priority::REROUTE),
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(id as usize).copied().ok_or(id)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Noop => "NOOP",
            Self::RateLimit => "RATE_LIMIT",
            Self::Drop => "DROP",
            Self::Reroute => "REROUTE",
        })
    }
}

/// Measured throughput of one port, bits per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortRate {
    /// Transmit rate
    pub tx_bps: f64,
    /// Receive rate
    pub rx_bps: f64,
}

/// Normalized policy input; every field is in [0,1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Transmit rate against the link scale
    pub tx_rate_norm: f64,
    /// Receive rate against the link scale
    pub rx_rate_norm: f64,
    /// Switch id against its scale
    pub switch_id_norm: f64,
    /// Port number against its scale
    pub port_norm: f64,
}

impl Observation {
    /// Feature vector `[tx, rx, switch, port]`
    pub fn to_features(&self) -> [f64; 4] {
        [
            self.tx_rate_norm,
            self.rx_rate_norm,
            self.switch_id_norm,
            self.port_norm,
        ]
    }

    /// The busier direction
    pub fn peak_rate(&self) -> f64 {
        self.tx_rate_norm.max(self.rx_rate_norm)
    }
}

/// Turns raw rates into observations
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizationConfig,
}

impl Normalizer {
    /// Create normalizer from validated scales
    pub fn new(config: NormalizationConfig) -> Self {
        Self { config }
    }

    /// Observation for one port rate sample
    pub fn observe(&self, dpid: DatapathId, port: PortNo, rate: PortRate) -> Observation {
        Observation {
            tx_rate_norm: clamp_unit(rate.tx_bps / self.config.rate_scale_bps),
            rx_rate_norm: clamp_unit(rate.rx_bps / self.config.rate_scale_bps),
            switch_id_norm: clamp_unit(dpid.get() as f64 / self.config.switch_id_scale),
            port_norm: clamp_unit(port as f64 / self.config.port_scale),
        }
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NormalizationConfig::default())
    }
}

#[inline]
fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

/// Decision maker consulted once per port per poll round
#[async_trait]
pub trait PolicyOracle: Send + Sync {
    /// Choose an action; treated as a pure function of `observation`
    async fn decide(&self, observation: &Observation) -> Action;

    /// Name for logs
    fn name(&self) -> &str;
}

/// Run the oracle within `budget`; `None` when it did not answer in time
pub async fn decide_within(
    oracle: &dyn PolicyOracle,
    observation: &Observation,
    budget: Duration,
) -> Option<Action> {
    tokio::time::timeout(budget, oracle.decide(observation))
        .await
        .ok()
}

/// Thresholds on the busier direction's normalized rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdPolicyConfig {
    /// Rate-limit at or above this load
    pub rate_limit_at: f64,
    /// Drop at or above this load
    pub drop_at: f64,
    /// Reroute at or above this load when below the rate-limit band
    pub reroute_at: Option<f64>,
}

impl Default for ThresholdPolicyConfig {
    fn default() -> Self {
        Self {
            rate_limit_at: 0.5,
            drop_at: 0.9,
            reroute_at: None,
        }
    }
}

/// Fixed-rule reference policy
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    config: ThresholdPolicyConfig,
}

impl ThresholdPolicy {
    /// Create policy; bands must be ordered reroute < rate-limit <= drop
    pub fn new(config: ThresholdPolicyConfig) -> Result<Self, ConfigError> {
        if !(config.rate_limit_at > 0.0 && config.rate_limit_at <= config.drop_at) {
            return Err(ConfigError(format!(
                "threshold policy needs 0 < rate_limit_at <= drop_at, got {} and {}",
                config.rate_limit_at, config.drop_at
            )));
        }
        if let Some(reroute) = config.reroute_at {
            if !(reroute > 0.0 && reroute < config.rate_limit_at) {
                return Err(ConfigError(format!(
                    "threshold policy needs 0 < reroute_at < rate_limit_at, got {}",
                    reroute
                )));
            }
        }
        Ok(Self { config })
    }

    /// Synchronous decision
    pub fn classify(&self, observation: &Observation) -> Action {
        let load = observation.peak_rate();

        if load >= self.config.drop_at {
            Action::Drop
        } else if load >= self.config.rate_limit_at {
            Action::RateLimit
        } else if self.config.reroute_at.map(|r| load >= r).unwrap_or(false) {
            Action::Reroute
        } else {
            Action::Noop
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            config: ThresholdPolicyConfig::default(),
        }
    }
}

#[async_trait]
impl PolicyOracle for ThresholdPolicy {
    async fn decide(&self, observation: &Observation) -> Action {
        self.classify(observation)
    }

    fn name(&self) -> &str {
        "threshold"
    }
}

/// Policy that always returns the same action
#[derive(Debug, Clone, Copy)]
pub struct StaticPolicy(pub Action);

#[async_trait]
impl PolicyOracle for StaticPolicy {
    async fn decide(&self, _observation: &Observation) -> Action {
        self.0
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Policy selection in configuration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// [`ThresholdPolicy`]
    Threshold(ThresholdPolicyConfig),
    /// [`StaticPolicy`]; `noop` gives a monitor-only controller
    Static {
        /// Action returned for every port
        action: Action,
    },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::Threshold(ThresholdPolicyConfig::default())
    }
}

impl PolicyConfig {
    /// Instantiate the configured policy
    pub fn build(&self) -> Result<Arc<dyn PolicyOracle>, ConfigError> {
        Ok(match self {
            Self::Threshold(config) => Arc::new(ThresholdPolicy::new(config.clone())?),
            Self::Static { action } => Arc::new(StaticPolicy(*action)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(tx: f64, rx: f64) -> Observation {
        Observation {
            tx_rate_norm: tx,
            rx_rate_norm: rx,
            switch_id_norm: 0.01,
            port_norm: 0.03,
        }
    }

    #[test]
    fn test_action_ids() {
        for action in Action::ALL {
            assert_eq!(Action::try_from(action.id()), Ok(action));
        }
        assert_eq!(Action::try_from(4), Err(4));
    }

    #[test]
    fn test_priority_ordering() {
        let drop = Action::Drop.priority().unwrap();
        let limit = Action::RateLimit.priority().unwrap();
        let reroute = Action::Reroute.priority().unwrap();

        assert!(drop > limit);
        assert!(limit > reroute);
        assert!(reroute > priority::LEARNED);
        assert!(priority::LEARNED > priority::TABLE_MISS);
        assert_eq!(Action::Noop.priority(), None);
    }

    #[test]
    fn test_normalizer_scales_and_clamps() {
        let normalizer = Normalizer::default();
        let obs = normalizer.observe(
            DatapathId(1),
            3,
            PortRate {
                tx_bps: 50e6,
                rx_bps: 250e6,
            },
        );

        assert_eq!(obs.tx_rate_norm, 0.5);
        assert_eq!(obs.rx_rate_norm, 1.0);
        assert_eq!(obs.switch_id_norm, 0.01);
        assert_eq!(obs.port_norm, 0.03);

        // reserved port numbers saturate
        let idle = PortRate {
            tx_bps: 0.0,
            rx_bps: 0.0,
        };
        let local = normalizer.observe(DatapathId(500), 0xffff_fffe, idle);
        assert_eq!(local.switch_id_norm, 1.0);
        assert_eq!(local.port_norm, 1.0);
        assert_eq!(local.tx_rate_norm, 0.0);
    }

    #[test]
    fn test_threshold_bands() {
        let policy = ThresholdPolicy::new(ThresholdPolicyConfig {
            rate_limit_at: 0.5,
            drop_at: 0.9,
            reroute_at: Some(0.3),
        })
        .unwrap();

        assert_eq!(policy.classify(&observation(0.1, 0.0)), Action::Noop);
        assert_eq!(policy.classify(&observation(0.0, 0.35)), Action::Reroute);
        assert_eq!(policy.classify(&observation(0.6, 0.2)), Action::RateLimit);
        assert_eq!(policy.classify(&observation(0.2, 0.95)), Action::Drop);
    }

    #[test]
    fn test_threshold_rejects_unordered_bands() {
        assert!(ThresholdPolicy::new(ThresholdPolicyConfig {
            rate_limit_at: 0.9,
            drop_at: 0.5,
            reroute_at: None,
        })
        .is_err());

        assert!(ThresholdPolicy::new(ThresholdPolicyConfig {
            rate_limit_at: 0.5,
            drop_at: 0.9,
            reroute_at: Some(0.7),
        })
        .is_err());
    }

    #[test]
    fn test_policy_config_from_json() {
        let config: PolicyConfig =
            serde_json::from_str(r#"{"kind":"static","action":"noop"}"#).unwrap();
        assert_eq!(config, PolicyConfig::Static { action: Action::Noop });

        let config: PolicyConfig =
            serde_json::from_str(r#"{"kind":"threshold","drop_at":0.8}"#).unwrap();
        let oracle = config.build().unwrap();
        assert_eq!(oracle.name(), "threshold");
    }

    struct SlowPolicy;

    #[async_trait]
    impl PolicyOracle for SlowPolicy {
        async fn decide(&self, _observation: &Observation) -> Action {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Action::Drop
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exceeded_yields_none() {
        let obs = observation(1.0, 1.0);
        assert_eq!(decide_within(&SlowPolicy, &obs, Duration::from_millis(50)).await, None);
        assert_eq!(
            decide_within(&StaticPolicy(Action::Drop), &obs, Duration::from_millis(50)).await,
            Some(Action::Drop)
        );
    }
}
