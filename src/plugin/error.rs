use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a single plugin failed to converge.
///
/// Every variant is a plain value: the sync engine collects one per failed
/// plugin and keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Invalid or conflicting plugin declaration.
    #[error("invalid plugin spec: {0}")]
    Config(String),

    /// Clone or fetch could not reach the remote. Usually worth a retry.
    #[error("network error: {0}")]
    Network(String),

    /// The requested revision does not exist in the repository.
    #[error("revision '{revision}' not found: {message}")]
    Revision { revision: String, message: String },

    /// Tracked files were modified locally; nothing was touched.
    #[error("dirty worktree at {}: commit or stash local changes first", path.display())]
    DirtyWorktree { path: PathBuf },

    /// Permission, disk or layout problem on the install root.
    #[error("filesystem error at {}: {message}", path.display())]
    Filesystem { path: PathBuf, message: String },

    /// Any other non-zero git exit.
    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("cancelled before start")]
    Cancelled,
}

impl SyncError {
    pub fn filesystem(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Filesystem {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Short label used in the report summary.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "config",
            SyncError::Network(_) => "network",
            SyncError::Revision { .. } => "revision",
            SyncError::DirtyWorktree { .. } => "dirty-worktree",
            SyncError::Filesystem { .. } => "filesystem",
            SyncError::Git { .. } => "git",
            SyncError::Timeout { .. } => "timeout",
            SyncError::Cancelled => "cancelled",
        }
    }
}
