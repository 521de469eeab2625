use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::error::{lock_err, ConfirmResult, ExecutionError};

use super::record::{CorrelationId, OperationRecord, OperationSnapshot, ResolutionReason};

/// Message to an operation's tracker thread.
#[derive(Debug)]
pub(crate) enum TrackerCommand {
    Cancel {
        reason: ResolutionReason,
        reply: Sender<bool>,
    },
}

/// Handles for reaching one operation.
#[derive(Debug, Clone)]
pub(crate) struct OperationHandle {
    pub record: Arc<RwLock<OperationRecord>>,
    pub control: Sender<TrackerCommand>,
    /// Disconnects when the tracker thread exits.
    pub done: Receiver<()>,
}

impl OperationHandle {
    pub fn snapshot(&self) -> ConfirmResult<OperationSnapshot> {
        Ok(self.record.read().map_err(|_| lock_err("operation record"))?.snapshot())
    }

    pub fn is_terminal(&self) -> ConfirmResult<bool> {
        Ok(self.record.read().map_err(|_| lock_err("operation record"))?.is_terminal())
    }
}

/// Owned map of live and recently resolved operations.
///
/// Readers clone a record under its own read lock while holding the map's
/// read lock; the purge removes entries under the map's write lock. A reader
/// therefore sees a whole record or `UnknownOperation`, never a torn one.
#[derive(Debug)]
pub(crate) struct OperationRegistry {
    entries: RwLock<HashMap<CorrelationId, OperationHandle>>,
    retention: Duration,
}

impl OperationRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn insert(&self, id: CorrelationId, handle: OperationHandle) -> ConfirmResult<()> {
        self.entries
            .write()
            .map_err(|_| lock_err("operation registry"))?
            .insert(id, handle);
        Ok(())
    }

    /// Handle for a known, unexpired operation.
    pub fn handle(&self, id: CorrelationId) -> ConfirmResult<OperationHandle> {
        {
            let entries = self.entries.read().map_err(|_| lock_err("operation registry"))?;
            let handle = entries.get(&id).ok_or(ExecutionError::UnknownOperation { id })?;
            let record = handle.record.read().map_err(|_| lock_err("operation record"))?;
            if !record.is_expired(self.retention, Instant::now()) {
                return Ok(handle.clone());
            }
        }
        // Expired but not yet swept.
        self.purge_expired()?;
        Err(ExecutionError::UnknownOperation { id }.into())
    }

    /// Non-blocking snapshot of an operation.
    ///
    /// # Errors
    /// `UnknownOperation` if the id was never issued or its retention has passed.
    pub fn snapshot(&self, id: CorrelationId) -> ConfirmResult<OperationSnapshot> {
        {
            let entries = self.entries.read().map_err(|_| lock_err("operation registry"))?;
            let handle = entries.get(&id).ok_or(ExecutionError::UnknownOperation { id })?;
            let record = handle.record.read().map_err(|_| lock_err("operation record"))?;
            if !record.is_expired(self.retention, Instant::now()) {
                return Ok(record.snapshot());
            }
        }
        // Expired but not yet swept.
        self.purge_expired()?;
        Err(ExecutionError::UnknownOperation { id }.into())
    }

    /// Removes every terminal record older than the retention window.
    pub fn purge_expired(&self) -> ConfirmResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| lock_err("operation registry"))?;
        let before = entries.len();
        let mut poisoned = false;
        entries.retain(|_, handle| match handle.record.read() {
            Ok(record) => !record.is_expired(self.retention, now),
            Err(_) => {
                poisoned = true;
                true
            }
        });
        if poisoned {
            return Err(lock_err("operation record"));
        }
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "purged expired operations");
        }
        Ok(purged)
    }

    /// Handles of every operation still pending.
    pub fn pending(&self) -> ConfirmResult<Vec<(CorrelationId, OperationHandle)>> {
        let entries = self.entries.read().map_err(|_| lock_err("operation registry"))?;
        let mut out = Vec::new();
        for (id, handle) in entries.iter() {
            if !handle.is_terminal()? {
                out.push((*id, handle.clone()));
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    pub fn len(&self) -> ConfirmResult<usize> {
        Ok(self.entries.read().map_err(|_| lock_err("operation registry"))?.len())
    }
}
