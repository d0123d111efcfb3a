//! Method name constants: every JSON-RPC method grouped by resource.
//!
//! Each constant is the exact string sent over the wire as the `method`
//! field of a request. Names are dot separated `resource.action`.

/// All exec-agent method names, grouped by resource.
pub struct Methods;

impl Methods {
    // ── Process ─────────────────────────────────────────────────────────
    pub const PROCESS_START: &str = "process.start";
    pub const PROCESS_KILL: &str = "process.kill";
    pub const PROCESS_GET_PROCESS: &str = "process.getProcess";
    pub const PROCESS_GET_PROCESSES: &str = "process.getProcesses";
    pub const PROCESS_GET_LOGS: &str = "process.getLogs";
    pub const PROCESS_WAIT: &str = "process.wait";
}

/// Split a method name into its `(resource, action)` halves.
///
/// Returns `None` for names without a dot or with an empty half.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    let (resource, action) = method.split_once('.')?;
    if resource.is_empty() || action.is_empty() {
        return None;
    }
    Some((resource, action))
}

/// Type alias: the method name is always a `&str` at the protocol level.
pub type MethodName = &'static str;
