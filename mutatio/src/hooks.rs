//! Observability callbacks.
//!
//! The core never renders anything itself. Presentation layers subscribe to what they care about
//! and the tracker, lock manager and runners call back through a shared [`Hooks`] value.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Error;
use crate::lock::LockRecord;
use crate::tracker::OperationRecord;

/// A change in lock ownership.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LockEvent {
    Acquired(LockRecord),
    Released {
        config: String,
        holder: String,
    },
    ForceReleased {
        config: String,
        previous: Option<LockRecord>,
    },
}

type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
type RecordCallback = Arc<dyn Fn(&OperationRecord) + Send + Sync>;
type LockCallback = Arc<dyn Fn(&LockEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    on_error: Option<ErrorCallback>,
    on_operation_recorded: Option<RecordCallback>,
    on_lock_change: Option<LockCallback>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_error", &self.on_error.is_some())
            .field("on_operation_recorded", &self.on_operation_recorded.is_some())
            .field("on_lock_change", &self.on_lock_change.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for failures the core absorbs instead of returning, such as a failed staleness
    /// update after teardown.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called each time an operation reaches a terminal status.
    pub fn on_operation_recorded<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OperationRecord) + Send + Sync + 'static,
    {
        self.on_operation_recorded = Some(Arc::new(callback));
        self
    }

    pub fn on_lock_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LockEvent) + Send + Sync + 'static,
    {
        self.on_lock_change = Some(Arc::new(callback));
        self
    }

    pub(crate) fn error(&self, error: &Error) {
        if let Some(ref callback) = self.on_error {
            callback(error);
        }
    }

    pub(crate) fn operation_recorded(&self, record: &OperationRecord) {
        if let Some(ref callback) = self.on_operation_recorded {
            callback(record);
        }
    }

    pub(crate) fn lock_changed(&self, event: &LockEvent) {
        if let Some(ref callback) = self.on_lock_change {
            callback(event);
        }
    }
}
