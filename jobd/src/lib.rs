//! Job dispatch master.
//!
//! [`JobControl`] owns the control listener and the table of expected worker
//! slots. Dispatching a [`RunProfile`](jobctl_profiles::RunProfile) registers
//! one single-use code per worker, launches the workers, and lets each one
//! authenticate over the handshake in [`session`]. Bound workers are handed
//! to the caller through a [`JobEventSink`].

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

pub mod control;
pub mod dispatcher;
pub mod error;
pub mod journal;
pub mod launcher;
pub mod listener;
pub mod session;
pub mod sink;
pub mod slots;
pub mod stats;

pub use control::JobControl;
pub use dispatcher::{DispatchReport, LaunchOutcome, SlotLaunch};
pub use error::{ControlError, Result};
pub use launcher::{ExitWatch, LaunchedProcess, ProcessLauncher, ShellLauncher};
pub use listener::ControlListener;
pub use session::{ConnectionState, HandshakeOutcome, LostReason, RejectReason};
pub use sink::{ChannelSink, JobEvent, JobEventSink, SessionHandle};
pub use slots::{AbortSummary, SlotStatus, SlotTable};
pub use stats::{ControlStats, StatsSnapshot};

/// One dispatch of a run profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a worker slot. Unique for the lifetime of a [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobNumber(pub u64);

impl fmt::Display for JobNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
