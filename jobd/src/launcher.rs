//! Starting worker processes.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command as TokioCommand;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// How long [`ShellLauncher`] waits for an immediate exit before handing the
/// child to a background reaper.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(150);

/// Resolves when a launched process exits: `Err` carries the failure.
pub type ExitWatch = oneshot::Receiver<std::result::Result<(), String>>;

#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    /// Set when the process is still running at launch time.
    pub exit: Option<ExitWatch>,
}

/// Runs one fully rendered command line. Returning `Ok` means the process
/// was started, not that the worker will ever connect.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, command_line: &str) -> Result<LaunchedProcess>;
}

/// Hands command lines to `sh -c`, so `ssh`, queue submitters and shell
/// syntax in templates work as written.
///
/// A non-zero exit within the grace period is a launch error. Children still
/// running after it are reaped in the background and report their exit
/// through [`LaunchedProcess::exit`].
#[derive(Debug, Clone)]
pub struct ShellLauncher {
    shell: String,
    exit_grace: Duration,
}

impl Default for ShellLauncher {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

impl ShellLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            ..Self::default()
        }
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }
}

#[async_trait]
impl ProcessLauncher for ShellLauncher {
    async fn launch(&self, command_line: &str) -> Result<LaunchedProcess> {
        let mut command = TokioCommand::new(&self.shell);
        command.arg("-c").arg(command_line);
        command.stdin(Stdio::null());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|err| {
            ControlError::Launch(format!("failed to spawn '{}': {}", command_line, err))
        })?;
        let pid = child.id();

        match timeout(self.exit_grace, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(pid, command = command_line, "Launcher process exited");
                return Ok(LaunchedProcess { pid, exit: None });
            }
            Ok(Ok(status)) => {
                return Err(ControlError::Launch(format!(
                    "'{}' exited with {}",
                    command_line, status
                )));
            }
            Ok(Err(err)) => {
                return Err(ControlError::Launch(format!(
                    "failed to wait for '{}': {}",
                    command_line, err
                )));
            }
            Err(_) => {}
        }
        info!(pid, command = command_line, "Launched worker");

        let (tx, rx) = oneshot::channel();
        let label = command_line.to_string();
        tokio::spawn(async move {
            let result = match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(pid, command = %label, "Launcher process exited");
                    Ok(())
                }
                Ok(status) => {
                    warn!(pid, command = %label, "Launcher process exited with {}", status);
                    Err(format!("exited with {}", status))
                }
                Err(err) => {
                    warn!(pid, command = %label, "Failed to reap launcher process: {}", err);
                    Err(format!("failed to reap: {}", err))
                }
            };
            if tx.send(result).is_err() {
                debug!(pid, "Exit watch dropped");
            }
        });

        Ok(LaunchedProcess {
            pid,
            exit: Some(rx),
        })
    }
}
