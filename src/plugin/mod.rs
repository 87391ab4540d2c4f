pub mod error;
pub mod git;
pub mod install_state;
pub mod installer;
pub mod manager;
pub mod registry;
pub mod report;
pub mod runtime;
pub mod spec;
pub mod triggers;

pub use error::SyncError;
pub use git::{Checkout, GitBackend, GitCli};
pub use install_state::{InstallState, InstalledEntry};
pub use installer::{CancelToken, SyncEngine};
pub use manager::PluginManager;
pub use registry::Registry;
pub use report::{Outcome, SyncAction, SyncReport, SyncResult};
pub use runtime::{Host, Plugin, Runtime};
pub use spec::{PluginOptions, RepoSpec};
pub use triggers::{HookKey, TriggerEvent, Triggers};
