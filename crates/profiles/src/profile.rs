use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::RunCommand;
use crate::error::{ProfileError, Result};
use crate::template::EXECUTABLE;

/// Registry-assigned identifier, unique within one [`RunProfileManager`](crate::RunProfileManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to launch the workers of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProfile {
    pub(crate) id: ProfileId,
    name: String,
    manager_command_template: String,
    commands: Vec<RunCommand>,
}

impl RunProfile {
    /// A profile with no commands. The id is assigned when it is added to a
    /// manager.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ProfileId(0),
            name: name.into(),
            manager_command_template: String::new(),
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn manager_command_template(&self) -> &str {
        &self.manager_command_template
    }

    pub fn set_manager_command(&mut self, template: impl Into<String>) {
        self.manager_command_template = template.into();
    }

    /// Launching goes through the manager template whenever one is set.
    pub fn delegates_to_manager(&self) -> bool {
        !self.manager_command_template.trim().is_empty()
    }

    pub fn commands(&self) -> &[RunCommand] {
        &self.commands
    }

    pub fn command_mut(&mut self, index: usize) -> Option<&mut RunCommand> {
        self.commands.get_mut(index)
    }

    pub fn add_command(&mut self, command: RunCommand) {
        self.commands.push(command);
    }

    /// Build and append a command in one step.
    pub fn add_command_parts(
        &mut self,
        command_template: impl Into<String>,
        replica_count: u32,
        threads_per_copy: u32,
        delay_ms: u64,
    ) -> Result<()> {
        let command =
            RunCommand::with_options(command_template, replica_count, threads_per_copy, delay_ms)?;
        self.commands.push(command);
        Ok(())
    }

    pub fn remove_command(&mut self, index: usize) -> Result<RunCommand> {
        if index >= self.commands.len() {
            return Err(ProfileError::CommandIndex {
                index,
                len: self.commands.len(),
            });
        }
        Ok(self.commands.remove(index))
    }

    pub fn remove_all_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of worker processes a dispatch of this profile launches.
    pub fn total_jobs(&self) -> u64 {
        self.commands
            .iter()
            .map(|command| u64::from(command.replica_count()))
            .sum()
    }

    /// Fix the worker executable in every template.
    ///
    /// In run commands `$command` becomes `value` followed by the per-slot
    /// placeholders (`$address $port $code $threads`), which the dispatcher
    /// fills later. `$executable` becomes `value` everywhere. The manager
    /// template keeps its `$command`, which still stands for the rendered run
    /// command. A value containing `$` is refused, so a second call is a
    /// no-op.
    pub fn substitute_executable_name(&mut self, value: &str) -> Result<()> {
        if value.contains('$') {
            return Err(ProfileError::PlaceholderInValue(value.to_string()));
        }
        for command in &mut self.commands {
            command.substitute_executable(value);
        }
        self.manager_command_template = self.manager_command_template.replace(EXECUTABLE, value);
        Ok(())
    }
}
