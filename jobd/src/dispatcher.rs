//! Turning a run profile into launched workers.
//!
//! Every slot's code is registered before the first process starts, so a
//! worker that connects quickly never races its own registration. A launch
//! failure marks only that slot as failed; the remaining slots are still
//! launched. A launcher process that exits with an error later, while its
//! slot is still pending, fails the slot the same way.

use std::sync::Arc;
use std::time::Duration;

use jobctl_common::{ControlConfig, JobCode};
use jobctl_profiles::template::{render_manager_command, render_run_command};
use jobctl_profiles::{LaunchValues, RunProfile};
use serde_json::json;
use tracing::{info, warn};

use crate::control::ControlContext;
use crate::journal::{EV_DISPATCH, EV_LAUNCH_FAILED};
use crate::launcher::{ExitWatch, ProcessLauncher};
use crate::sink::JobEventSink;
use crate::{JobId, JobNumber};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Launched { pid: Option<u32> },
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SlotLaunch {
    pub job_number: JobNumber,
    pub code: JobCode,
    pub command_line: String,
    pub outcome: LaunchOutcome,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub job_id: JobId,
    pub profile: String,
    pub slots: Vec<SlotLaunch>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn launched(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.outcome, LaunchOutcome::Launched { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.launched()
    }
}

pub struct Dispatcher {
    ctx: Arc<ControlContext>,
    launcher: Arc<dyn ProcessLauncher>,
    config: ControlConfig,
    addresses: String,
    port: u16,
}

impl Dispatcher {
    pub(crate) fn new(
        ctx: Arc<ControlContext>,
        launcher: Arc<dyn ProcessLauncher>,
        config: ControlConfig,
        addresses: &[String],
        port: u16,
    ) -> Self {
        Self {
            ctx,
            launcher,
            config,
            addresses: addresses.join(","),
            port,
        }
    }

    /// Launch `profile.total_jobs()` workers of `executable`. Returns once
    /// every launch has been attempted; connections arrive afterwards
    /// through `sink`.
    pub async fn dispatch(
        &self,
        profile: &RunProfile,
        executable: &str,
        sink: Arc<dyn JobEventSink>,
    ) -> DispatchReport {
        let job_id = JobId::new();
        let job = job_id.to_string();
        let executable = self.config.resolve_executable(executable);
        let total = profile.total_jobs();

        let mut codes = Vec::new();
        for _ in 0..total {
            codes.push(self.ctx.slots.register(job_id, Arc::clone(&sink)));
        }

        info!(
            job_id = %job,
            profile = profile.name(),
            slots = total,
            port = self.port,
            "Dispatching job"
        );
        self.ctx.record(
            EV_DISPATCH,
            &job,
            None,
            json!({
                "profile": profile.name(),
                "executable": executable,
                "slots": total,
                "port": self.port,
            }),
        );
        if total == 0 {
            warn!(profile = profile.name(), "Run profile has no commands; nothing to launch");
        }

        let mut slots = Vec::with_capacity(codes.len());
        let mut issued = codes.into_iter();
        for command in profile.commands() {
            for _ in 0..command.replica_count() {
                let Some((job_number, code)) = issued.next() else {
                    break;
                };
                let values = LaunchValues {
                    executable: &executable,
                    addresses: &self.addresses,
                    port: self.port,
                    code: code.as_str(),
                    threads: command.threads_per_copy(),
                };
                let run = render_run_command(command.command_template(), &values);
                let command_line = if profile.delegates_to_manager() {
                    render_manager_command(profile.manager_command_template(), &run, &values)
                } else {
                    run
                };

                let outcome = match self.launcher.launch(&command_line).await {
                    Ok(process) => {
                        if let Some(exit) = process.exit {
                            watch_exit(
                                Arc::clone(&self.ctx),
                                Arc::clone(&sink),
                                job.clone(),
                                job_number,
                                exit,
                            );
                        }
                        LaunchOutcome::Launched { pid: process.pid }
                    }
                    Err(err) => {
                        let error = err.to_string();
                        fail_slot(&self.ctx, sink.as_ref(), &job, job_number, &error);
                        LaunchOutcome::Failed(error)
                    }
                };
                slots.push(SlotLaunch {
                    job_number,
                    code,
                    command_line,
                    outcome,
                });

                if command.delay_ms() > 0 && slots.len() < total as usize {
                    tokio::time::sleep(Duration::from_millis(command.delay_ms())).await;
                }
            }
        }

        DispatchReport {
            job_id,
            profile: profile.name().to_string(),
            slots,
        }
    }
}

fn fail_slot(
    ctx: &ControlContext,
    sink: &dyn JobEventSink,
    job: &str,
    job_number: JobNumber,
    error: &str,
) {
    if !ctx.slots.mark_failed(job_number) {
        return;
    }
    ctx.stats.record_launch_failure();
    warn!(job_id = %job, %job_number, "Worker launch failed: {}", error);
    ctx.record(
        EV_LAUNCH_FAILED,
        job,
        Some(job_number),
        json!({ "error": error }),
    );
    sink.on_launch_failed(job_number, error.to_string());
}

/// Fail the slot if its launcher exits with an error before the worker
/// connects. Exits after binding are ignored.
fn watch_exit(
    ctx: Arc<ControlContext>,
    sink: Arc<dyn JobEventSink>,
    job: String,
    job_number: JobNumber,
    exit: ExitWatch,
) {
    tokio::spawn(async move {
        if let Ok(Err(error)) = exit.await {
            fail_slot(&ctx, sink.as_ref(), &job, job_number, &error);
        }
    });
}
