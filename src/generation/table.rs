//! Job table: status and cancellation flags for every job this session.
//!
//! The table is the cancel handler's view of the world: it answers whether a
//! track id belongs to a queued job, the active job, or something already
//! finished. Terminal entries are kept so repeated cancels get
//! `ALREADY_COMPLETE` instead of `TRACK_NOT_FOUND`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{CancelFlag, JobStatus};

struct TableEntry {
    status: JobStatus,
    cancel: CancelFlag,
}

#[derive(Default)]
pub struct JobTable {
    entries: Mutex<HashMap<String, TableEntry>>,
    active: Mutex<Option<String>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly admitted job.
    pub fn insert_queued(&self, track_id: &str, cancel: CancelFlag) {
        let mut entries = self.entries.lock().expect("job table lock poisoned");
        entries.insert(
            track_id.to_string(),
            TableEntry {
                status: JobStatus::Queued,
                cancel,
            },
        );
    }

    /// Current status of a job, if the table has seen it.
    pub fn status(&self, track_id: &str) -> Option<JobStatus> {
        let entries = self.entries.lock().expect("job table lock poisoned");
        entries.get(track_id).map(|e| e.status)
    }

    /// The cancellation flag shared with the job, if known.
    pub fn cancel_flag(&self, track_id: &str) -> Option<CancelFlag> {
        let entries = self.entries.lock().expect("job table lock poisoned");
        entries.get(track_id).map(|e| e.cancel.clone())
    }

    pub fn set_status(&self, track_id: &str, status: JobStatus) {
        let mut entries = self.entries.lock().expect("job table lock poisoned");
        if let Some(entry) = entries.get_mut(track_id) {
            entry.status = status;
        }
    }

    /// Marks the worker's current job. At most one job is generating at any
    /// time.
    pub fn set_active(&self, track_id: &str) {
        self.set_status(track_id, JobStatus::Generating);
        *self.active.lock().expect("job table lock poisoned") = Some(track_id.to_string());
    }

    /// Clears the active slot and records the job's terminal status.
    pub fn finish_active(&self, track_id: &str, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.set_status(track_id, status);
        let mut active = self.active.lock().expect("job table lock poisoned");
        if active.as_deref() == Some(track_id) {
            *active = None;
        }
    }

    /// True while the worker is running a job.
    pub fn worker_busy(&self) -> bool {
        self.active.lock().expect("job table lock poisoned").is_some()
    }
}
