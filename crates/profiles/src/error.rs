use std::io;

use thiserror::Error;

use crate::profile::ProfileId;

pub type Result<T> = std::result::Result<T, ProfileError>;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("replica count must be at least 1, got {0}")]
    InvalidReplicaCount(u32),

    #[error("threads per copy must be at least 1")]
    InvalidThreadCount,

    #[error("run profile {0} not found")]
    NotFound(ProfileId),

    #[error("run command index {index} out of range ({len} commands)")]
    CommandIndex { index: usize, len: usize },

    #[error("run profile id {0} is already registered")]
    DuplicateId(ProfileId),

    #[error("replacement value '{0}' contains '$'")]
    PlaceholderInValue(String),

    #[error("malformed profile data: {0}")]
    Malformed(String),

    #[error("unsupported profile export version {0}")]
    UnsupportedVersion(u32),

    #[error("profile store i/o failed: {0}")]
    Io(#[from] io::Error),
}
