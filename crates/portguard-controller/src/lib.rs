//! portguard controller daemon
//!
//! Binds the switch channel, opens the CSV telemetry log and runs the
//! [`portguard_core::Controller`] until interrupted.

pub mod config;
pub mod server;
pub mod stats_log;

pub use config::DaemonConfig;
pub use server::{ChannelHandle, ServerError, SwitchServer};
pub use stats_log::CsvEventLog;
