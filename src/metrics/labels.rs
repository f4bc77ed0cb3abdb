//! Label values

use crate::connection::ValidationMode;

/// Connection discarded because it was broken
pub const DISCARD_BROKEN: &str = "broken";
/// Connection discarded because its pool was closed
pub const DISCARD_CLOSED: &str = "closed";

/// Probe returned a status reply
pub const PROBE_OK: &str = "ok";
/// Probe failed or timed out
pub const PROBE_FAILED: &str = "failed";

/// Label for a validation mode
pub fn mode(mode: ValidationMode) -> &'static str {
    match mode {
        ValidationMode::Skip => "skip",
        ValidationMode::ValidateCa => "validate_ca",
        ValidationMode::ValidateCaAndHostname => "validate_ca_and_hostname",
    }
}
