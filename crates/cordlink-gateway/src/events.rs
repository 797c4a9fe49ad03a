//! Dispatch event names the session reacts to
//!
//! Every other event is passed through to the dispatch callback untouched.

/// Sent after a successful Identify; carries the session id
pub const READY: &str = "READY";

/// Sent after a successful Resume, once missed events were replayed
pub const RESUMED: &str = "RESUMED";

/// Whether the event changes session state rather than application state
#[must_use]
pub fn is_session_event(name: &str) -> bool {
    matches!(name, READY | RESUMED)
}
