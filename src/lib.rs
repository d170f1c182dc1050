pub mod catalog;
pub mod config;
pub mod confirm;
pub mod database;
pub mod error;
pub mod events;
pub mod executor;
pub mod lock;
pub mod planner;
pub mod process;
pub mod session;
pub mod utils;
pub mod version;

pub use catalog::{CatalogEntry, PopularApp};
pub use config::Config;
pub use confirm::{
    AutoPolicy, Confirmation, ConfirmationGate, ConfirmationPrompt, Decision, DialoguerPrompt,
};
pub use database::{Database, DbHandle, InstalledSet, PackageInfo};
pub use error::{InstallerError, InstallerResult};
pub use executor::{ExecutionReport, TransactionExecutor};
pub use lock::{LockManager, LockToken};
pub use planner::{
    CommandRefresher, ConflictKind, ConflictReport, Operation, Planner, SyncRefresher, TargetSet,
    TransactionPlan, TrialOutcome,
};
pub use process::{ProcessEvent, ProcessOutcome, ProcessRunner, ProcessState};
pub use session::{OperationOutcome, Session, SessionEvent, UpdateOutcome};

pub const PKGINSTALL_VERSION: &str = env!("CARGO_PKG_VERSION");

use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
    pub static ref PKGINSTALL_HOME: PathBuf = {
        if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
        } else {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
        }
    };
    pub static ref PKGINSTALL_CONFIG: PathBuf = {
        if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_home).join("pkginstall")
        } else {
            PKGINSTALL_HOME.join(".config").join("pkginstall")
        }
    };
    pub static ref PKGINSTALL_DATA: PathBuf = {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home).join("pkginstall")
        } else {
            PKGINSTALL_HOME.join(".local").join("share").join("pkginstall")
        }
    };
}
