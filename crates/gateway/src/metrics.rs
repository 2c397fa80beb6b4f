//! Gateway metrics
//!
//! - `gateway_context_checks_total` (counter): label `verdict`
//! - `gateway_call_failures_total` (counter): label `kind`
//!
//! `credential_refresh_total{outcome}` is emitted by the OAuth provider.
//! With no recorder installed these calls are no-ops.

use crate::context::SizeVerdict;
use crate::transport::CallFailure;

/// Record one request-size check.
pub fn record_context_check(verdict: SizeVerdict) {
    metrics::counter!("gateway_context_checks_total", "verdict" => verdict.label()).increment(1);
}

/// Record an outbound call failure by class.
pub fn record_call_failure(failure: &CallFailure) {
    metrics::counter!("gateway_call_failures_total", "kind" => failure.label()).increment(1);
}
