//! Trace identifiers propagated from the gateway through broker message headers.
//!
//! There is no ambient trace state: callers resolve a trace id per message and pass it on.
use uuid::Uuid;

/// Header carrying the trace id set by the gateway.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Normalize a raw header value: surrounding whitespace is ignored and blank values are absent.
pub fn resolve_trace_id(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(str::to_owned)
}

/// Generate a fresh trace id, for work that arrived without one.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}
