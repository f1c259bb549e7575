use crate::error::{ProfileError, Result};
use crate::template::{worker_invocation_template, COMMAND, EXECUTABLE};

/// One launch directive inside a [`RunProfile`](crate::RunProfile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCommand {
    command_template: String,
    replica_count: u32,
    threads_per_copy: u32,
    delay_ms: u64,
}

impl RunCommand {
    /// Single-threaded command without a launch delay.
    pub fn new(command_template: impl Into<String>, replica_count: u32) -> Result<Self> {
        Self::with_options(command_template, replica_count, 1, 0)
    }

    pub fn with_options(
        command_template: impl Into<String>,
        replica_count: u32,
        threads_per_copy: u32,
        delay_ms: u64,
    ) -> Result<Self> {
        if replica_count < 1 {
            return Err(ProfileError::InvalidReplicaCount(replica_count));
        }
        if threads_per_copy < 1 {
            return Err(ProfileError::InvalidThreadCount);
        }
        Ok(Self {
            command_template: command_template.into(),
            replica_count,
            threads_per_copy,
            delay_ms,
        })
    }

    pub fn command_template(&self) -> &str {
        &self.command_template
    }

    pub fn replica_count(&self) -> u32 {
        self.replica_count
    }

    pub fn threads_per_copy(&self) -> u32 {
        self.threads_per_copy
    }

    /// Pause after launching each replica of this command.
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn set_command(&mut self, command_template: impl Into<String>) {
        self.command_template = command_template.into();
    }

    pub fn set_replica_count(&mut self, replica_count: u32) -> Result<()> {
        if replica_count < 1 {
            return Err(ProfileError::InvalidReplicaCount(replica_count));
        }
        self.replica_count = replica_count;
        Ok(())
    }

    pub fn set_threads_per_copy(&mut self, threads: u32) -> Result<()> {
        if threads < 1 {
            return Err(ProfileError::InvalidThreadCount);
        }
        self.threads_per_copy = threads;
        Ok(())
    }

    pub fn set_delay_ms(&mut self, delay_ms: u64) {
        self.delay_ms = delay_ms;
    }

    /// `value` must not contain `$`.
    pub(crate) fn substitute_executable(&mut self, value: &str) {
        self.command_template = self
            .command_template
            .replace(COMMAND, &worker_invocation_template(value))
            .replace(EXECUTABLE, value);
    }
}
