//! Serialized form of a set of run profiles.
//!
//! Ids are not part of the export: an import gets fresh ids from
//! the receiving manager, so exporting the imported set reproduces the
//! document it came from.

use serde::{Deserialize, Serialize};

use crate::command::RunCommand;
use crate::error::{ProfileError, Result};
use crate::profile::RunProfile;

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileExport {
    pub version: u32,
    pub profiles: Vec<ProfileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    #[serde(default)]
    pub manager_command: String,
    pub commands: Vec<CommandRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub replicas: u32,
    #[serde(default = "default_threads")]
    pub threads: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_threads() -> u32 {
    1
}

impl ProfileExport {
    pub fn new(profiles: Vec<ProfileRecord>) -> Self {
        Self {
            version: EXPORT_VERSION,
            profiles,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| ProfileError::Malformed(format!("failed to serialise profiles: {err}")))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let export: Self = serde_json::from_str(raw)
            .map_err(|err| ProfileError::Malformed(err.to_string()))?;
        if export.version != EXPORT_VERSION {
            return Err(ProfileError::UnsupportedVersion(export.version));
        }
        Ok(export)
    }
}

impl From<&RunProfile> for ProfileRecord {
    fn from(profile: &RunProfile) -> Self {
        Self {
            name: profile.name().to_string(),
            manager_command: profile.manager_command_template().to_string(),
            commands: profile
                .commands()
                .iter()
                .map(|command| CommandRecord {
                    command: command.command_template().to_string(),
                    replicas: command.replica_count(),
                    threads: command.threads_per_copy(),
                    delay_ms: command.delay_ms(),
                })
                .collect(),
        }
    }
}

impl ProfileRecord {
    /// Rebuild a profile, enforcing the same rules as the constructors.
    pub fn to_profile(&self) -> Result<RunProfile> {
        let mut profile = RunProfile::new(self.name.clone());
        profile.set_manager_command(self.manager_command.clone());
        for (index, record) in self.commands.iter().enumerate() {
            let command = RunCommand::with_options(
                record.command.clone(),
                record.replicas,
                record.threads,
                record.delay_ms,
            )
            .map_err(|err| {
                ProfileError::Malformed(format!(
                    "profile '{}' command {}: {}",
                    self.name, index, err
                ))
            })?;
            profile.add_command(command);
        }
        Ok(profile)
    }
}
