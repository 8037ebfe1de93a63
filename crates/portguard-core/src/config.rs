//! Controller configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the controller core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Seconds between port-stats rounds
    pub poll_interval_secs: f64,
    /// Upper bound for one outbound operation on one switch
    pub switch_op_timeout_ms: u64,
    /// Time the policy oracle gets per port before the round counts as NOOP
    pub oracle_budget_ms: u64,
    /// Observation scaling
    pub normalization: NormalizationConfig,
    /// Learning-switch rules
    pub learning: LearningConfig,
    /// Mitigation rules
    pub enforcement: EnforcementConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1.0,
            switch_op_timeout_ms: 500,
            oracle_budget_ms: 50,
            normalization: NormalizationConfig::default(),
            learning: LearningConfig::default(),
            enforcement: EnforcementConfig::default(),
        }
    }
}

impl ControllerConfig {
    const MIN_INTERVAL: f64 = 0.001;

    /// Poll period
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs.max(Self::MIN_INTERVAL))
    }

    /// Per-switch operation timeout
    pub fn switch_op_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_op_timeout_ms)
    }

    /// Oracle decision budget
    pub fn oracle_budget(&self) -> Duration {
        Duration::from_millis(self.oracle_budget_ms)
    }

    /// Reject values that would stall polling or install permanent rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.poll_interval_secs.is_finite() || self.poll_interval_secs < Self::MIN_INTERVAL {
            return Err(ConfigError(format!(
                "poll_interval_secs must be at least {}, got {}",
                Self::MIN_INTERVAL,
                self.poll_interval_secs
            )));
        }
        if self.switch_op_timeout_ms == 0 {
            return Err(ConfigError("switch_op_timeout_ms must be positive".into()));
        }
        if self.oracle_budget_ms == 0 {
            return Err(ConfigError("oracle_budget_ms must be positive".into()));
        }
        self.normalization.validate()?;

        if self.enforcement.idle_timeout_secs == 0 {
            return Err(ConfigError(
                "enforcement.idle_timeout_secs must be positive so mitigations expire".into(),
            ));
        }
        if self.enforcement.meter_rate_kbps == 0 {
            return Err(ConfigError("enforcement.meter_rate_kbps must be positive".into()));
        }
        Ok(())
    }
}

/// Reference scales for turning raw measurements into [0,1] features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Link rate (bits/s) that maps to 1.0
    pub rate_scale_bps: f64,
    /// Switch id that maps to 1.0
    pub switch_id_scale: f64,
    /// Port number that maps to 1.0
    pub port_scale: f64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            rate_scale_bps: 100e6,
            switch_id_scale: 100.0,
            port_scale: 100.0,
        }
    }
}

impl NormalizationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("rate_scale_bps", self.rate_scale_bps),
            ("switch_id_scale", self.switch_id_scale),
            ("port_scale", self.port_scale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError(format!(
                    "normalization.{} must be positive, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Unicast rules installed by the learning switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Idle timeout of learned unicast rules
    pub flow_idle_timeout_secs: u16,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            flow_idle_timeout_secs: 60,
        }
    }
}

/// Mitigation rule parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Drop-band rate of rate-limit meters
    pub meter_rate_kbps: u32,
    /// Drop-band burst of rate-limit meters
    pub meter_burst_kbps: u32,
    /// Meter id = base + port number
    pub meter_id_base: u32,
    /// Idle timeout of mitigation rules
    pub idle_timeout_secs: u16,
    /// Delete a superseded mitigation rule instead of waiting for it to expire
    pub withdraw_superseded: bool,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            meter_rate_kbps: 5000,
            meter_burst_kbps: 0,
            meter_id_base: 1000,
            idle_timeout_secs: 20,
            withdraw_superseded: true,
        }
    }
}
