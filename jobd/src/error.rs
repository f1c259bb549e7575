use std::io;

use jobctl_common::ConfigError;
use thiserror::Error;

use crate::JobNumber;

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no free port in range [{start}, {end})")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("invalid control configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid bind address '{0}'")]
    BindAddress(String),

    #[error("session {0} is closed")]
    SessionClosed(JobNumber),

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
