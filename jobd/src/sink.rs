//! Delivery of bound sessions and their traffic to the job's consumer.

use std::net::SocketAddr;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ControlError, Result};
use crate::session::LostReason;
use crate::{JobId, JobNumber};

/// Receives the events of one dispatched job. Callbacks run on session
/// tasks and must not block.
pub trait JobEventSink: Send + Sync {
    /// The worker for `session.job_number()` completed the handshake.
    fn on_connected(&self, session: SessionHandle);
    /// Bytes the worker wrote after being bound.
    fn on_data(&self, job_number: JobNumber, data: Vec<u8>);
    /// The bound session ended. The slot is already released.
    fn on_lost(&self, job_number: JobNumber, reason: LostReason);
    /// The worker process for a still pending slot could not be started or
    /// exited with an error. The slot is already marked failed.
    fn on_launch_failed(&self, job_number: JobNumber, error: String);
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send(Vec<u8>),
    Close,
}

/// Write side of a bound worker connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    job_id: JobId,
    job_number: JobNumber,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(
        job_id: JobId,
        job_number: JobNumber,
        peer: SocketAddr,
    ) -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                job_id,
                job_number,
                peer,
                tx,
            },
            rx,
        )
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_number(&self) -> JobNumber {
        self.job_number
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue bytes for the worker.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        self.tx
            .send(SessionCommand::Send(data.into()))
            .map_err(|_| ControlError::SessionClosed(self.job_number))
    }

    /// Ask the session task to drop the connection.
    pub fn close(&self) {
        if self.tx.send(SessionCommand::Close).is_err() {
            debug!(job_number = %self.job_number, "Session already closed");
        }
    }
}

#[derive(Debug)]
pub enum JobEvent {
    Connected(SessionHandle),
    Data { job_number: JobNumber, data: Vec<u8> },
    Lost { job_number: JobNumber, reason: LostReason },
    LaunchFailed { job_number: JobNumber, error: String },
}

/// Forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            debug!("Job event receiver dropped");
        }
    }
}

impl JobEventSink for ChannelSink {
    fn on_connected(&self, session: SessionHandle) {
        self.forward(JobEvent::Connected(session));
    }

    fn on_data(&self, job_number: JobNumber, data: Vec<u8>) {
        self.forward(JobEvent::Data { job_number, data });
    }

    fn on_lost(&self, job_number: JobNumber, reason: LostReason) {
        self.forward(JobEvent::Lost { job_number, reason });
    }

    fn on_launch_failed(&self, job_number: JobNumber, error: String) {
        self.forward(JobEvent::LaunchFailed { job_number, error });
    }
}
