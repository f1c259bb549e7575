//! Table of expected workers.
//!
//! Every slot starts `Pending` with a single-use code. Claiming a code
//! removes it from the pending index and marks the slot `Bound` in one
//! locked step, so two connections presenting the same code cannot both
//! win.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jobctl_common::JobCode;
use serde::Serialize;

use crate::sink::{JobEventSink, SessionHandle};
use crate::{JobId, JobNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Waiting for its worker to identify.
    Pending,
    Bound,
    /// The bound worker went away.
    Released,
    /// The worker could not be launched.
    Failed,
}

impl SlotStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SlotStatus::Released | SlotStatus::Failed)
    }
}

struct SlotRecord {
    job_id: JobId,
    code: JobCode,
    status: SlotStatus,
    sink: Arc<dyn JobEventSink>,
}

impl fmt::Debug for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRecord")
            .field("job_id", &self.job_id)
            .field("code", &self.code)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<JobCode, JobNumber>,
    slots: HashMap<JobNumber, SlotRecord>,
    sessions: HashMap<JobNumber, SessionHandle>,
    next_number: u64,
}

/// What a successful claim hands to the session.
#[derive(Clone)]
pub struct ClaimedSlot {
    pub job_id: JobId,
    pub job_number: JobNumber,
    pub sink: Arc<dyn JobEventSink>,
}

impl fmt::Debug for ClaimedSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedSlot")
            .field("job_id", &self.job_id)
            .field("job_number", &self.job_number)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AbortSummary {
    /// Slots still waiting for a worker.
    pub discarded: usize,
    /// Bound sessions asked to close.
    pub closed: usize,
}

#[derive(Debug, Default)]
pub struct SlotTable {
    inner: Mutex<Inner>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a pending slot with a code not currently pending anywhere.
    pub fn register(&self, job_id: JobId, sink: Arc<dyn JobEventSink>) -> (JobNumber, JobCode) {
        let mut inner = self.lock();
        let code = loop {
            let candidate = JobCode::generate();
            if !inner.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.next_number += 1;
        let job_number = JobNumber(inner.next_number);
        inner.pending.insert(code, job_number);
        inner.slots.insert(
            job_number,
            SlotRecord {
                job_id,
                code,
                status: SlotStatus::Pending,
                sink,
            },
        );
        (job_number, code)
    }

    /// Consume a pending code. `None` for codes that were never issued,
    /// already claimed, failed, or aborted.
    pub fn claim(&self, code: &JobCode) -> Option<ClaimedSlot> {
        let mut inner = self.lock();
        let job_number = inner.pending.remove(code)?;
        let record = inner.slots.get_mut(&job_number)?;
        record.status = SlotStatus::Bound;
        Some(ClaimedSlot {
            job_id: record.job_id,
            job_number,
            sink: Arc::clone(&record.sink),
        })
    }

    /// Store the session of a freshly bound slot. False if the slot was
    /// aborted between claim and attach.
    pub fn attach_session(&self, handle: SessionHandle) -> bool {
        let mut inner = self.lock();
        let job_number = handle.job_number();
        match inner.slots.get(&job_number) {
            Some(record) if record.status == SlotStatus::Bound => {
                inner.sessions.insert(job_number, handle);
                true
            }
            _ => false,
        }
    }

    /// A bound worker went away. False if the slot was not bound.
    pub fn release(&self, job_number: JobNumber) -> bool {
        let mut inner = self.lock();
        inner.sessions.remove(&job_number);
        match inner.slots.get_mut(&job_number) {
            Some(record) if record.status == SlotStatus::Bound => {
                record.status = SlotStatus::Released;
                true
            }
            _ => false,
        }
    }

    /// The worker for a pending slot was never started, or died before it
    /// connected; its code stops being accepted. False if the slot was not
    /// pending.
    pub fn mark_failed(&self, job_number: JobNumber) -> bool {
        let mut inner = self.lock();
        let code = match inner.slots.get_mut(&job_number) {
            Some(record) if record.status == SlotStatus::Pending => {
                record.status = SlotStatus::Failed;
                record.code
            }
            _ => return false,
        };
        inner.pending.remove(&code);
        true
    }

    /// Forget every slot of a job, closing its bound sessions.
    pub fn abort_job(&self, job_id: JobId) -> AbortSummary {
        let mut summary = AbortSummary::default();
        let mut to_close = Vec::new();
        {
            let mut inner = self.lock();
            let numbers: Vec<JobNumber> = inner
                .slots
                .iter()
                .filter(|(_, record)| record.job_id == job_id)
                .map(|(number, _)| *number)
                .collect();

            for number in numbers {
                let Some(record) = inner.slots.remove(&number) else {
                    continue;
                };
                if record.status == SlotStatus::Pending {
                    inner.pending.remove(&record.code);
                    summary.discarded += 1;
                }
                if let Some(handle) = inner.sessions.remove(&number) {
                    to_close.push(handle);
                }
            }
        }

        summary.closed = to_close.len();
        for handle in to_close {
            handle.close();
        }
        summary
    }

    pub fn status(&self, job_number: JobNumber) -> Option<SlotStatus> {
        self.lock().slots.get(&job_number).map(|record| record.status)
    }

    /// Slots of one job, ordered by job number.
    pub fn job_slots(&self, job_id: JobId) -> Vec<(JobNumber, SlotStatus)> {
        let inner = self.lock();
        let mut slots: Vec<_> = inner
            .slots
            .iter()
            .filter(|(_, record)| record.job_id == job_id)
            .map(|(number, record)| (*number, record.status))
            .collect();
        slots.sort_by_key(|(number, _)| *number);
        slots
    }

    /// True once every slot of the job has been released or failed.
    pub fn job_finished(&self, job_id: JobId) -> bool {
        self.lock()
            .slots
            .values()
            .filter(|record| record.job_id == job_id)
            .all(|record| record.status.is_terminal())
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }
}
