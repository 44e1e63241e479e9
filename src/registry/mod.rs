//! Admission control for conversion tasks.
//!
//! The registry bounds how many conversion tasks may exist concurrently and
//! enforces at most one active task per requester. It is the only state
//! shared across concurrent requests; every mutation happens under one lock
//! so simultaneous admission attempts cannot both pass the checks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::task::ConversionTask;

/// Identity of a requester (e.g. a chat or session id)
pub type RequesterId = i64;

/// Admission-time rejections
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("a conversion is already in progress for this requester")]
    AlreadyActive,

    #[error("all conversion slots are busy")]
    QueueFull,
}

enum Slot {
    /// Admitted, task not created yet
    Reserved,
    /// Admitted and bound to its task
    Bound(Arc<ConversionTask>),
}

pub struct TaskRegistry {
    max_queue_size: usize,
    slots: Mutex<HashMap<RequesterId, Slot>>,
}

impl TaskRegistry {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for `requester`.
    ///
    /// The slot is recorded before any task exists, so a second request from
    /// the same identity arriving mid-creation is already rejected. The
    /// returned ticket releases the slot when dropped, which makes release
    /// happen exactly once on every terminal path.
    pub fn try_admit(&self, requester: RequesterId) -> Result<AdmissionTicket<'_>, AdmissionError> {
        let mut slots = self.lock_slots();
        if slots.contains_key(&requester) {
            return Err(AdmissionError::AlreadyActive);
        }
        if slots.len() >= self.max_queue_size {
            return Err(AdmissionError::QueueFull);
        }
        slots.insert(requester, Slot::Reserved);
        Ok(AdmissionTicket {
            registry: self,
            requester,
        })
    }

    /// Remove the record for `requester`, freeing its slot.
    pub fn release(&self, requester: RequesterId) {
        self.lock_slots().remove(&requester);
    }

    /// The active task for `requester`, used to route cancellation commands.
    pub fn lookup(&self, requester: RequesterId) -> Option<Arc<ConversionTask>> {
        match self.lock_slots().get(&requester) {
            Some(Slot::Bound(task)) => Some(Arc::clone(task)),
            _ => None,
        }
    }

    /// Number of currently admitted requesters, bound or reserved.
    pub fn active_count(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<RequesterId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved capacity slot, released on drop.
pub struct AdmissionTicket<'a> {
    registry: &'a TaskRegistry,
    requester: RequesterId,
}

impl std::fmt::Debug for AdmissionTicket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("requester", &self.requester)
            .finish()
    }
}

impl AdmissionTicket<'_> {
    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    /// Attach the created task to the slot so `lookup` can find it.
    pub fn bind(&self, task: Arc<ConversionTask>) {
        self.registry
            .lock_slots()
            .insert(self.requester, Slot::Bound(task));
    }
}

impl Drop for AdmissionTicket<'_> {
    fn drop(&mut self) {
        self.registry.release(self.requester);
    }
}
