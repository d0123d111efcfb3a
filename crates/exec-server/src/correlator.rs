//! Correlator: per-connection table of ids still owed a response.

use std::collections::HashSet;

use exec_protocol::RequestId;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("request id {0} is already outstanding")]
    DuplicateId(RequestId),
    #[error("connection is closed")]
    Closed,
}

#[derive(Default)]
struct Table {
    outstanding: HashSet<RequestId>,
    closed: bool,
}

/// At most one response per id: an id is registered when its call is
/// accepted and removed right before the response is written.
#[derive(Default)]
pub struct Correlator {
    table: Mutex<Table>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` as outstanding.
    pub fn begin(&self, id: &RequestId) -> Result<(), CorrelatorError> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(CorrelatorError::Closed);
        }
        if !table.outstanding.insert(id.clone()) {
            return Err(CorrelatorError::DuplicateId(id.clone()));
        }
        Ok(())
    }

    /// Claim the right to answer `id`. Returns false when the id is not
    /// outstanding, i.e. it was already answered or the connection closed.
    pub fn complete(&self, id: &RequestId) -> bool {
        let removed = self.table.lock().outstanding.remove(id);
        if !removed {
            debug!("No outstanding request {id}; completion ignored");
        }
        removed
    }

    /// Drop every outstanding id and refuse new ones. Returns how many
    /// were discarded.
    pub fn discard_all(&self) -> usize {
        let mut table = self.table.lock();
        table.closed = true;
        let discarded = table.outstanding.len();
        table.outstanding.clear();
        discarded
    }

    pub fn outstanding(&self) -> usize {
        self.table.lock().outstanding.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}
