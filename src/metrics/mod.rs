//! Metrics emitted through the `metrics` facade
//!
//! Nothing is recorded unless the application installs a recorder
//! (for example a Prometheus exporter). All names carry the `docwire_` prefix.
//!
//! * [`counters`] for connect attempts, pool events and probe outcomes
//! * [`histograms`] for connect, pool wait and probe round-trip durations
//! * [`labels`] for the label values shared by both

pub mod counters;
pub mod histograms;
pub mod labels;
