//! Persistence seam for run profiles.
//!
//! The relational store of the full application sits behind [`ProfileStore`];
//! [`JsonProfileStore`] is the file-backed implementation the `jobd` CLI uses.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProfileError, Result};
use crate::export::ProfileRecord;
use crate::manager::RunProfileManager;
use crate::profile::{ProfileId, RunProfile};

pub trait ProfileStore {
    fn load_all(&self) -> Result<Vec<RunProfile>>;
    /// Insert or replace by id.
    fn save(&self, profile: &RunProfile) -> Result<()>;
    fn delete(&self, id: ProfileId) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    profiles: Vec<StoredProfile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredProfile {
    id: ProfileId,
    #[serde(flatten)]
    record: ProfileRecord,
}

/// Profiles kept in a single JSON document. Writes take an exclusive lock
/// on a sibling `.lock` file and replace the document atomically.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the whole document with the manager's current profiles.
    pub fn save_all(&self, manager: &RunProfileManager) -> Result<()> {
        let _lock = self.lock()?;
        let file = StoreFile {
            profiles: manager.iter().map(stored).collect(),
        };
        self.write(&file)
    }

    fn read(&self) -> Result<StoreFile> {
        if !self.path.exists() {
            return Ok(StoreFile::default());
        }
        let file = File::open(&self.path)?;
        serde_json::from_reader(file).map_err(|err| {
            ProfileError::Malformed(format!(
                "failed to parse profile store {}: {}",
                self.path.display(),
                err
            ))
        })
    }

    fn write(&self, contents: &StoreFile) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut temp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        serde_json::to_writer_pretty(&mut temp, contents).map_err(|err| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("failed to serialise profile store: {}", err),
            )
        })?;
        temp.sync_all()?;
        drop(temp);

        fs::rename(&temp_path, &self.path)?;

        #[cfg(target_family = "unix")]
        {
            let dir_handle = File::open(&dir)?;
            dir_handle.sync_all()?;
        }

        debug!(
            count = contents.profiles.len(),
            "Wrote profile store {}",
            self.path.display()
        );
        Ok(())
    }

    fn lock(&self) -> Result<File> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)?;
        let lock = File::create(self.path.with_extension("lock"))?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn stored(profile: &RunProfile) -> StoredProfile {
    StoredProfile {
        id: profile.id(),
        record: ProfileRecord::from(profile),
    }
}

impl ProfileStore for JsonProfileStore {
    fn load_all(&self) -> Result<Vec<RunProfile>> {
        self.read()?
            .profiles
            .into_iter()
            .map(|entry| {
                let mut profile = entry.record.to_profile()?;
                profile.id = entry.id;
                Ok(profile)
            })
            .collect()
    }

    fn save(&self, profile: &RunProfile) -> Result<()> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        let entry = stored(profile);
        match file.profiles.iter_mut().find(|p| p.id == entry.id) {
            Some(existing) => *existing = entry,
            None => file.profiles.push(entry),
        }
        self.write(&file)
    }

    fn delete(&self, id: ProfileId) -> Result<()> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        let before = file.profiles.len();
        file.profiles.retain(|p| p.id != id);
        if file.profiles.len() == before {
            return Err(ProfileError::NotFound(id));
        }
        self.write(&file)
    }
}
