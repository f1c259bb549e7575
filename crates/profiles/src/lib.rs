//! Run profiles: how many worker processes to launch for a job, and with
//! which command lines.
//!
//! A [`RunProfile`] is an ordered list of [`RunCommand`]s (template plus
//! replica count) and an optional manager template used when launching is
//! delegated to an external queue manager. [`RunProfileManager`] is the
//! registry the rest of the system looks profiles up in.

pub mod command;
pub mod error;
pub mod export;
pub mod manager;
pub mod profile;
pub mod store;
pub mod template;

pub use command::RunCommand;
pub use error::{ProfileError, Result};
pub use export::{CommandRecord, ProfileExport, ProfileRecord};
pub use manager::RunProfileManager;
pub use profile::{ProfileId, RunProfile};
pub use store::{JsonProfileStore, ProfileStore};
pub use template::LaunchValues;
