//! Imports userChrome CSS mods from local files, URLs and GitHub repositories
//! into a browser profile's chrome directory, tracks them in a per-profile
//! registry and applies updates with backup and rollback.

pub mod app;
pub mod apply;
pub mod archive;
pub mod config;
pub mod error;
pub mod github;
pub mod http;
pub mod payload;
pub mod registry;
pub mod source;
pub mod update;
pub mod userchrome;
pub mod version;

pub use app::{App, PendingRecovery, RecoverAction};
pub use apply::{ApplyState, ProfileLayout, UpdateReport};
pub use config::{AppConfig, PlacementChoice};
pub use error::{ErrorKind, ModError, Result};
pub use registry::{ModEntry, ModOrigin, Placement};
pub use source::{classify, SourceKind};
pub use update::{CheckCancel, UpdateStatus};
