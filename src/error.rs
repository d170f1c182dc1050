use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type InstallerResult<T> = Result<T, InstallerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Database,
    Lock,
    Sync,
    Process,
    Transaction,
    UserInput,
    General,
}

#[derive(Error, Debug)]
pub enum InstallerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Failed to open package database: {0}")]
    DatabaseOpen(String),

    #[error("Package database is locked by another process: {0}")]
    LockBusy(String),

    #[error("Another package operation is already in progress: {0}")]
    DatabaseLock(String),

    #[error("Lock file unusable: {0}")]
    LockFile(String),

    #[error("Failed to synchronize package databases: {0}")]
    Sync(String),

    #[error("Trial synchronization failed: {0}")]
    SyncTrial(String),

    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("A process is already running: {0}")]
    ProcessBusy(String),

    #[error("No process is running: {0}")]
    ProcessNotRunning(String),

    #[error("Nothing to terminate")]
    NothingToTerminate,

    #[error("Failed to start process: {0}")]
    ProcessSpawn(String),

    #[error("Transaction plan is stale: computed against snapshot {planned}, database is at {current}")]
    StalePlan { planned: u64, current: u64 },

    #[error("Package lists must be refreshed before continuing: {0}")]
    ListsInvalidated(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl InstallerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            InstallerError::DatabaseOpen(_) => ErrorCategory::Database,
            InstallerError::LockBusy(_)
            | InstallerError::DatabaseLock(_)
            | InstallerError::LockFile(_) => ErrorCategory::Lock,
            InstallerError::Sync(_) | InstallerError::SyncTrial(_) => ErrorCategory::Sync,
            InstallerError::ProcessBusy(_)
            | InstallerError::ProcessNotRunning(_)
            | InstallerError::NothingToTerminate
            | InstallerError::ProcessSpawn(_) => ErrorCategory::Process,
            InstallerError::StalePlan { .. } | InstallerError::ListsInvalidated(_) => {
                ErrorCategory::Transaction
            }
            InstallerError::InvalidPackageName(_) | InstallerError::ConfigError(_) => {
                ErrorCategory::UserInput
            }
            _ => ErrorCategory::General,
        }
    }

    /// Conditions that abort the whole flow instead of being reported back to
    /// the caller for a decision.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InstallerError::DatabaseOpen(_) | InstallerError::LockFile(_)
        )
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InstallerError::LockBusy(_)
                | InstallerError::DatabaseLock(_)
                | InstallerError::Sync(_)
                | InstallerError::SyncTrial(_)
                | InstallerError::StalePlan { .. }
                | InstallerError::ListsInvalidated(_)
        )
    }

    pub fn is_lock_error(&self) -> bool {
        self.category() == ErrorCategory::Lock
    }
}
