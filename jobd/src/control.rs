use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use jobctl_common::ControlConfig;
use jobctl_profiles::RunProfile;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::error::{ControlError, Result};
use crate::journal::{Journal, EV_ABORT};
use crate::launcher::ProcessLauncher;
use crate::listener::ControlListener;
use crate::session::serve_connection;
use crate::sink::JobEventSink;
use crate::slots::{AbortSummary, SlotStatus, SlotTable};
use crate::stats::{ControlStats, StatsSnapshot};
use crate::{JobId, JobNumber};

/// State shared by the accept loop, the session tasks and the dispatcher.
pub(crate) struct ControlContext {
    pub(crate) slots: SlotTable,
    pub(crate) stats: ControlStats,
    pub(crate) journal: Option<Journal>,
    pub(crate) identify_timeout: Duration,
}

impl ControlContext {
    pub(crate) fn record(
        &self,
        event: &str,
        job: &str,
        slot: Option<JobNumber>,
        meta: serde_json::Value,
    ) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(event, job, slot.map(|n| n.0), meta) {
                warn!("Failed to append {} journal entry: {}", event, err);
            }
        }
    }
}

/// The master's control plane: one listener, one slot table, any number of
/// dispatched jobs.
pub struct JobControl {
    ctx: Arc<ControlContext>,
    dispatcher: Dispatcher,
    port: u16,
    addresses: Vec<String>,
    accept_task: JoinHandle<()>,
}

impl JobControl {
    /// Bind the listener and start accepting workers. Failing to find a
    /// free port is fatal.
    pub async fn start(config: ControlConfig, launcher: Arc<dyn ProcessLauncher>) -> Result<Self> {
        let listener = ControlListener::bind(&config).await?;
        let port = listener.port();
        let addresses = listener.addresses().to_vec();

        let journal = match config.journal_path.as_deref() {
            Some(path) => {
                let journal = Journal::open(Path::new(path), config.journal_secret.as_bytes())
                    .map_err(|err| ControlError::Journal(format!("{}: {}", path, err)))?;
                info!("Audit journal at {}", path);
                Some(journal)
            }
            None => None,
        };

        let ctx = Arc::new(ControlContext {
            slots: SlotTable::new(),
            stats: ControlStats::default(),
            journal,
            identify_timeout: config.identify_timeout(),
        });
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), launcher, config, &addresses, port);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx)));

        Ok(Self {
            ctx,
            dispatcher,
            port,
            addresses,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn slots(&self) -> &SlotTable {
        &self.ctx.slots
    }

    pub fn slot_status(&self, job_number: JobNumber) -> Option<SlotStatus> {
        self.ctx.slots.status(job_number)
    }

    pub async fn dispatch(
        &self,
        profile: &RunProfile,
        executable: &str,
        sink: Arc<dyn JobEventSink>,
    ) -> DispatchReport {
        self.dispatcher.dispatch(profile, executable, sink).await
    }

    /// Stop accepting the job's outstanding codes and close its bound
    /// sessions.
    pub fn abort_job(&self, job_id: JobId) -> AbortSummary {
        let summary = self.ctx.slots.abort_job(job_id);
        info!(
            job_id = %job_id,
            discarded = summary.discarded,
            closed = summary.closed,
            "Job aborted"
        );
        self.ctx.record(
            EV_ABORT,
            &job_id.to_string(),
            None,
            json!({ "discarded": summary.discarded, "closed": summary.closed }),
        );
        summary
    }

    pub fn job_finished(&self, job_id: JobId) -> bool {
        self.ctx.slots.job_finished(job_id)
    }

    /// Stop accepting connections. Bound sessions keep running until they
    /// end or are aborted.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for JobControl {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: ControlListener, ctx: Arc<ControlContext>) {
    debug!(port = listener.port(), "Accept loop started");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                ctx.stats.record_accepted();
                debug!(%peer, "Accepted worker connection");
                tokio::spawn(serve_connection(stream, peer, Arc::clone(&ctx)));
            }
            Err(err) => {
                warn!("Accept failed: {}", err);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
