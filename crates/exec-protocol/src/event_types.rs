//! Event type constants.
//!
//! Events are server-to-client frames with no id and no response.

/// All exec-agent event types.
pub struct EventTypes;

impl EventTypes {
    // ── Connection ──────────────────────────────────────────────────────
    pub const CONNECTED: &str = "connected";

    // ── Process ─────────────────────────────────────────────────────────
    pub const PROCESS_STARTED: &str = "process_started";
    pub const PROCESS_DIED: &str = "process_died";
    pub const PROCESS_STDOUT: &str = "process_stdout";
    pub const PROCESS_STDERR: &str = "process_stderr";
}

/// Type alias for event type names.
pub type EventType = &'static str;
