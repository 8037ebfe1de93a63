//! portguard core - control-plane engine of the port-mitigation controller
//!
//! Flow of a switch through the core:
//! - [`ConnectionRegistry`] tracks the session and capabilities
//! - [`LearningSwitch`] forwards punted frames over the [`ForwardingTable`]
//! - [`TelemetryPoller`] samples port counters and asks the [`PolicyOracle`]
//! - [`EnforcementEngine`] turns the decision into flow and meter mutations
//! - [`EventLog`] receives every raw sample
//!
//! [`Controller`] owns all of them and dispatches [`SwitchEvent`]s.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod controller;
pub mod enforcement;
pub mod error;
pub mod event_log;
pub mod forwarding;
pub mod learning;
pub mod policy;
pub mod registry;
pub mod switch;
pub mod telemetry;

pub use config::{ControllerConfig, EnforcementConfig, LearningConfig, NormalizationConfig};
pub use controller::{
    table_miss_rule, Controller, ControllerStats, EventKind, StatsSnapshot, SwitchEvent,
};
pub use enforcement::{Enforcement, EnforcementEngine, Mitigation};
pub use error::{ConfigError, EnforceError, EventLogError, RegistryError};
pub use event_log::{EventLog, MemoryEventLog, NullEventLog, StatsRecord};
pub use forwarding::ForwardingTable;
pub use learning::{LearningSwitch, PacketInOutcome};
pub use policy::{
    Action, Normalizer, Observation, PolicyConfig, PolicyOracle, PortRate, StaticPolicy,
    ThresholdPolicy, ThresholdPolicyConfig,
};
pub use registry::{ConnectionRegistry, EvictionListener, SwitchLink, SwitchState};
pub use switch::{RecordingSwitch, SharedHandle, SwitchHandle};
pub use telemetry::{PortOutcome, TelemetryPoller};
