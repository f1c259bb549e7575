// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod protocol;

pub use config::{ConfigError, ControlConfig};
pub use protocol::{Frame, FrameKind, JobCode, ProtocolError, CODE_SIZE, FRAME_SIZE};
