//! Acknowledgement correlation.
//!
//! Every outgoing packet that asks for an acknowledgement gets a fresh id
//! from a per-connection counter. The pending callback is parked under that
//! id until the matching ack frame arrives or the stream is torn down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use sio_core::error::{SioError, SioResult};

/// Callback invoked once with the ack arguments or the reason it never came.
pub type AckCallback = Box<dyn FnOnce(SioResult<Vec<Value>>) + Send>;

/// Pending-acknowledgement table for one transport connection.
pub struct AckCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, AckCallback>>,
}

impl AckCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh id, greater than every id issued before. Ids are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Park `callback` under `id`.
    pub fn register(&self, id: u64, callback: AckCallback) {
        self.pending.lock().insert(id, callback);
    }

    /// Allocate an id and park `callback` under it in one step.
    pub fn register_next(&self, callback: AckCallback) -> u64 {
        let id = self.next_id();
        self.register(id, callback);
        id
    }

    /// Resolve the callback registered under `id`.
    ///
    /// Returns false when nothing was pending under that id.
    pub fn resolve(&self, id: u64, args: Vec<Value>) -> bool {
        // The lock is released before the callback runs so it may emit again.
        let callback = self.pending.lock().remove(&id);
        match callback {
            Some(callback) => {
                callback(Ok(args));
                true
            }
            None => {
                debug!("dropping ack for unknown id {id}");
                false
            }
        }
    }

    /// Fail a single pending callback.
    pub fn fail(&self, id: u64, error: SioError) -> bool {
        let callback = self.pending.lock().remove(&id);
        match callback {
            Some(callback) => {
                callback(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every pending callback and clear the table.
    ///
    /// `error_for` builds the error for each id so callers can report which
    /// acknowledgement was abandoned.
    pub fn fail_all(&self, error_for: impl Fn(u64) -> SioError) -> usize {
        let drained: Vec<(u64, AckCallback)> = {
            let mut pending = self.pending.lock();
            let mut drained: Vec<_> = pending.drain().collect();
            drained.sort_by_key(|(id, _)| *id);
            drained
        };
        let count = drained.len();
        for (id, callback) in drained {
            callback(Err(error_for(id)));
        }
        if count > 0 {
            debug!("failed {count} pending acknowledgement(s)");
        }
        count
    }

    /// Number of acknowledgements still outstanding.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for AckCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
