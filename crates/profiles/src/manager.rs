use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ProfileError, Result};
use crate::export::{ProfileExport, ProfileRecord};
use crate::profile::{ProfileId, RunProfile};
use crate::store::ProfileStore;
use crate::template::COMMAND;

pub const BLANK_PROFILE_NAME: &str = "New Profile";
pub const DEFAULT_LOCAL_PROFILE_NAME: &str = "Default Local";

/// Ordered registry of run profiles.
///
/// Ids are unique and never reused within one manager. Names are not
/// required to be unique: [`find_by_name`](Self::find_by_name) returns the
/// first profile in registry order.
#[derive(Debug, Clone)]
pub struct RunProfileManager {
    profiles: Vec<RunProfile>,
    next_id: u64,
}

impl Default for RunProfileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunProfileManager {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
            next_id: 1,
        }
    }

    /// Populate a manager from the persistence collaborator, keeping the
    /// stored ids.
    pub fn load_from(store: &dyn ProfileStore) -> Result<Self> {
        let mut manager = Self::new();
        for profile in store.load_all()? {
            manager.restore_profile(profile)?;
        }
        debug!(count = manager.len(), "Loaded run profiles from store");
        Ok(manager)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunProfile> {
        self.profiles.iter()
    }

    /// Register a profile under a freshly assigned id.
    pub fn add_profile(&mut self, mut profile: RunProfile) -> ProfileId {
        let id = ProfileId(self.next_id);
        self.next_id += 1;
        profile.id = id;
        self.profiles.push(profile);
        id
    }

    /// Register a profile keeping its existing id.
    pub fn restore_profile(&mut self, profile: RunProfile) -> Result<ProfileId> {
        let id = profile.id();
        if self.profile_by_id(id).is_some() {
            return Err(ProfileError::DuplicateId(id));
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.profiles.push(profile);
        Ok(id)
    }

    pub fn add_blank_profile(&mut self) -> ProfileId {
        self.add_profile(RunProfile::new(BLANK_PROFILE_NAME))
    }

    /// One local replica of the worker, no external manager.
    pub fn add_default_local_profile(&mut self) -> ProfileId {
        let mut profile = RunProfile::new(DEFAULT_LOCAL_PROFILE_NAME);
        // A single replica is always a valid command.
        profile.add_command_parts(COMMAND, 1, 1, 0).ok();
        self.add_profile(profile)
    }

    pub fn remove_profile(&mut self, id: ProfileId) -> Result<RunProfile> {
        let position = self
            .profiles
            .iter()
            .position(|profile| profile.id() == id)
            .ok_or(ProfileError::NotFound(id))?;
        Ok(self.profiles.remove(position))
    }

    pub fn remove_all_profiles(&mut self) {
        self.profiles.clear();
    }

    pub fn profile(&self, index: usize) -> Option<&RunProfile> {
        self.profiles.get(index)
    }

    pub fn profile_id(&self, index: usize) -> Option<ProfileId> {
        self.profile(index).map(RunProfile::id)
    }

    pub fn profile_name(&self, index: usize) -> Option<&str> {
        self.profile(index).map(RunProfile::name)
    }

    pub fn last_profile(&self) -> Option<&RunProfile> {
        self.profiles.last()
    }

    pub fn total_jobs(&self, index: usize) -> Option<u64> {
        self.profile(index).map(RunProfile::total_jobs)
    }

    pub fn profile_by_id(&self, id: ProfileId) -> Option<&RunProfile> {
        self.profiles.iter().find(|profile| profile.id() == id)
    }

    pub fn profile_by_id_mut(&mut self, id: ProfileId) -> Option<&mut RunProfile> {
        self.profiles.iter_mut().find(|profile| profile.id() == id)
    }

    /// First profile with this name, in registry order.
    pub fn find_by_name(&self, name: &str) -> Option<&RunProfile> {
        self.profiles.iter().find(|profile| profile.name() == name)
    }

    /// Export the given profiles, in the order the ids are listed.
    pub fn export_profiles(&self, ids: &[ProfileId]) -> Result<ProfileExport> {
        let records = ids
            .iter()
            .map(|id| {
                self.profile_by_id(*id)
                    .map(ProfileRecord::from)
                    .ok_or(ProfileError::NotFound(*id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProfileExport::new(records))
    }

    /// Import every profile of an export under new ids. Nothing is added if
    /// any profile in the document is invalid.
    pub fn import_profiles(&mut self, export: &ProfileExport) -> Result<Vec<ProfileId>> {
        let profiles = export
            .profiles
            .iter()
            .map(ProfileRecord::to_profile)
            .collect::<Result<Vec<_>>>()?;
        Ok(profiles
            .into_iter()
            .map(|profile| self.add_profile(profile))
            .collect())
    }

    pub fn write_profiles_to_disk(&self, path: &Path, ids: &[ProfileId]) -> Result<()> {
        let export = self.export_profiles(ids)?;
        fs::write(path, export.to_json()?)?;
        info!(
            count = ids.len(),
            "Exported run profiles to {}",
            path.display()
        );
        Ok(())
    }

    pub fn import_profiles_from_disk(&mut self, path: &Path) -> Result<Vec<ProfileId>> {
        let raw = fs::read_to_string(path)?;
        let export = ProfileExport::from_json(&raw)?;
        let ids = self.import_profiles(&export)?;
        info!(
            count = ids.len(),
            "Imported run profiles from {}",
            path.display()
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cluster_profile(name: &str, hosts: &[&str]) -> RunProfile {
        let mut profile = RunProfile::new(name);
        profile.set_manager_command("/software/bin/$command");
        for host in hosts {
            for gpu in 0..2 {
                profile
                    .add_command_parts(
                        format!("ssh -f {host} \"CUDA_VISIBLE_DEVICES={gpu} $command\""),
                        1,
                        2,
                        100,
                    )
                    .unwrap();
            }
        }
        profile
    }

    #[test]
    fn ids_are_unique_and_stable_after_removal() {
        let mut manager = RunProfileManager::new();
        let a = manager.add_blank_profile();
        let b = manager.add_default_local_profile();
        manager.remove_profile(a).unwrap();
        let c = manager.add_blank_profile();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(manager.profile_id(0), Some(b));
        assert_eq!(manager.profile_id(1), Some(c));
        assert_eq!(manager.last_profile().map(RunProfile::id), Some(c));
    }

    #[test]
    fn default_local_profile_runs_one_replica_without_manager() {
        let mut manager = RunProfileManager::new();
        let id = manager.add_default_local_profile();
        let profile = manager.profile_by_id(id).unwrap();
        assert_eq!(profile.name(), DEFAULT_LOCAL_PROFILE_NAME);
        assert_eq!(profile.total_jobs(), 1);
        assert!(!profile.delegates_to_manager());
        assert_eq!(profile.commands()[0].command_template(), "$command");
    }

    #[test]
    fn removing_unknown_profile_reports_not_found() {
        let mut manager = RunProfileManager::new();
        manager.add_blank_profile();
        assert!(matches!(
            manager.remove_profile(ProfileId(99)),
            Err(ProfileError::NotFound(ProfileId(99)))
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn index_accessors_return_none_past_the_end() {
        let manager = RunProfileManager::new();
        assert!(manager.profile(0).is_none());
        assert!(manager.profile_id(0).is_none());
        assert!(manager.profile_name(0).is_none());
        assert!(manager.total_jobs(0).is_none());
    }

    #[test]
    fn find_by_name_returns_first_match() {
        let mut manager = RunProfileManager::new();
        let first = manager.add_profile(cluster_profile("gpus", &["a"]));
        let second = manager.add_profile(cluster_profile("gpus", &["b", "c"]));
        assert_ne!(first, second);
        assert_eq!(manager.find_by_name("gpus").map(RunProfile::id), Some(first));

        manager.remove_profile(first).unwrap();
        assert_eq!(manager.find_by_name("gpus").map(RunProfile::id), Some(second));
        assert!(manager.find_by_name("cpus").is_none());
    }

    #[test]
    fn export_import_export_is_stable() {
        let mut source = RunProfileManager::new();
        let a = source.add_profile(cluster_profile("96GPUs", &["h1", "h2", "h3"]));
        let b = source.add_default_local_profile();
        source.add_blank_profile();

        let exported = source.export_profiles(&[a, b]).unwrap();
        let mut target = RunProfileManager::new();
        target.add_blank_profile();
        let imported = target.import_profiles(&exported).unwrap();
        assert_eq!(imported.len(), 2);

        let reexported = target.export_profiles(&imported).unwrap();
        assert_eq!(reexported, exported);
        assert_eq!(
            target.profile_by_id(imported[0]).unwrap().total_jobs(),
            source.profile_by_id(a).unwrap().total_jobs()
        );
    }

    #[test]
    fn export_of_unknown_id_fails() {
        let mut manager = RunProfileManager::new();
        let id = manager.add_blank_profile();
        assert!(matches!(
            manager.export_profiles(&[id, ProfileId(42)]),
            Err(ProfileError::NotFound(ProfileId(42)))
        ));
    }

    #[test]
    fn malformed_import_adds_nothing() {
        let mut manager = RunProfileManager::new();
        let export = ProfileExport::new(vec![
            ProfileRecord::from(&cluster_profile("ok", &["a"])),
            ProfileRecord {
                name: "bad".into(),
                manager_command: String::new(),
                commands: vec![crate::export::CommandRecord {
                    command: "$command".into(),
                    replicas: 0,
                    threads: 1,
                    delay_ms: 0,
                }],
            },
        ]);
        assert!(manager.import_profiles(&export).is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn disk_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles.json");

        let mut source = RunProfileManager::new();
        let ids = vec![
            source.add_profile(cluster_profile("88GPUs", &["h2", "h3"])),
            source.add_profile(cluster_profile("48GPUs (1)", &["h1"])),
        ];
        source.write_profiles_to_disk(&path, &ids).unwrap();

        let mut target = RunProfileManager::new();
        let imported = target.import_profiles_from_disk(&path).unwrap();
        assert_eq!(
            target.export_profiles(&imported).unwrap(),
            source.export_profiles(&ids).unwrap()
        );
        assert_eq!(target.profile_name(1), Some("48GPUs (1)"));
    }
}
