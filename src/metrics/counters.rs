//! Counter metrics

/// A connect attempt started
pub fn connect_attempted(mode: &'static str) {
    metrics::counter!("docwire_connect_attempts_total", "mode" => mode).increment(1);
}

/// A connect attempt produced a ready connection
pub fn connect_succeeded(mode: &'static str) {
    metrics::counter!("docwire_connect_success_total", "mode" => mode).increment(1);
}

/// A connect attempt failed, labelled by failure kind
pub fn connect_failed(mode: &'static str, kind: &'static str) {
    metrics::counter!("docwire_connect_failures_total", "mode" => mode, "kind" => kind)
        .increment(1);
}

/// No pool permit became available in time
pub fn pool_timeout() {
    metrics::counter!("docwire_pool_acquire_timeouts_total").increment(1);
}

/// A connection was dropped instead of rejoining the idle set
pub fn pool_discarded(reason: &'static str) {
    metrics::counter!("docwire_pool_discarded_total", "reason" => reason).increment(1);
}

/// A heartbeat probe finished
pub fn probe_completed(outcome: &'static str) {
    metrics::counter!("docwire_probes_total", "outcome" => outcome).increment(1);
}

/// A member changed role
pub fn role_changed(role: &'static str) {
    metrics::counter!("docwire_role_changes_total", "role" => role).increment(1);
}
