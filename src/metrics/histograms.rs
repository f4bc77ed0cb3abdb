//! Histogram metrics (milliseconds)

/// Time from TCP connect to a ready connection
pub fn connect_duration(mode: &'static str, duration_ms: u64) {
    metrics::histogram!("docwire_connect_duration_ms", "mode" => mode).record(duration_ms as f64);
}

/// Time spent waiting for a pool permit
pub fn pool_wait_duration(duration_ms: u64) {
    metrics::histogram!("docwire_pool_wait_duration_ms").record(duration_ms as f64);
}

/// Round-trip time of a successful probe
pub fn probe_rtt(duration_ms: u64) {
    metrics::histogram!("docwire_probe_rtt_ms").record(duration_ms as f64);
}
