//! Replica-set topology tracking
//!
//! [`TopologyMonitor`] probes members in the background and publishes
//! [`TopologyState`] snapshots plus [`TopologyEvent`]s. Callers suspend on
//! [`TopologyMonitor::wait_for_role_change`] or
//! [`TopologyMonitor::wait_for_primary`] instead of polling.

mod description;
mod events;
mod monitor;

pub use description::{ProbeFailure, ServerDescription, ServerRole, TopologyState};
pub use events::TopologyEvent;
pub use monitor::{MonitorConfig, TopologyMonitor, DEFAULT_HEARTBEAT};
