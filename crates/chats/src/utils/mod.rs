//! Internal utilities for the conversation core.

pub mod validation;

pub use validation::Validator;

use std::time::Duration;

// Keeps `now + span` far away from chrono's overflow panic.
const MAX_SPAN_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Convert a configured interval to a chrono span, capped at a year
pub(crate) fn span(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(MAX_SPAN_MS);
    chrono::Duration::milliseconds(millis.min(MAX_SPAN_MS))
}
