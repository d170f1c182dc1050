use crate::{
    database::DbHandle,
    error::{InstallerError, InstallerResult},
    lock::LockToken,
    planner::{Operation, TransactionPlan},
    process::{ProcessRunner, ProcessState},
    utils::validate_package_names,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub operation: Operation,
    pub command: String,
    pub success: bool,
    pub state: ProcessState,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub duration_secs: u64,
}

pub struct TransactionExecutor {
    runner: Arc<ProcessRunner>,
    pacman_bin: String,
    privilege_command: Option<String>,
}

impl TransactionExecutor {
    pub fn new<S: Into<String>>(runner: Arc<ProcessRunner>, pacman_bin: S) -> Self {
        Self {
            runner,
            pacman_bin: pacman_bin.into(),
            privilege_command: None,
        }
    }

    pub fn with_privilege_command(mut self, command: Option<String>) -> Self {
        self.privilege_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    pub fn package_manager(&self) -> String {
        match &self.privilege_command {
            Some(prefix) => format!("{} {}", prefix, self.pacman_bin),
            None => self.pacman_bin.clone(),
        }
    }

    pub fn refresh_command(&self, args: &str) -> String {
        format!("{} {}", self.package_manager(), args)
    }

    /// The normal path passes `--noconfirm`. The override path answers pacman's
    /// own prompts with a stream of `y` instead, since `--noconfirm` declines
    /// conflict removals.
    pub fn build_command(
        &self,
        operation: Operation,
        names: &[String],
        override_conflicts: bool,
    ) -> InstallerResult<String> {
        if names.is_empty() {
            return Err(InstallerError::InvalidPackageName(
                "no packages to process".into(),
            ));
        }
        validate_package_names(names)?;

        let flag = match operation {
            Operation::Install => "-S",
            Operation::Remove => "-R",
        };
        let names = names.join(" ");
        let command = if override_conflicts {
            format!("yes | {} {} {}", self.package_manager(), flag, names)
        } else {
            format!("{} {} --noconfirm {}", self.package_manager(), flag, names)
        };
        Ok(command)
    }

    /// Runs the command while `lock` is held and lets go of it as soon as the
    /// process ends, whatever the outcome.
    pub async fn execute(
        &self,
        operation: Operation,
        names: &[String],
        override_conflicts: bool,
        lock: LockToken,
    ) -> InstallerResult<ExecutionReport> {
        let command = self.build_command(operation, names, override_conflicts)?;
        if !lock.is_locked() {
            return Err(InstallerError::DatabaseLock(
                "execution requires the database lock".into(),
            ));
        }

        let started = Instant::now();
        let result = self.runner.run(&command).await;
        if let Err(e) = lock.release() {
            warn!("Failed to release lock after {}: {}", operation, e);
        }
        let outcome = result?;

        let report = ExecutionReport {
            operation,
            command,
            success: outcome.success(),
            state: outcome.state,
            exit_code: outcome.exit_code,
            output: outcome.output,
            duration_secs: started.elapsed().as_secs(),
        };
        if report.success {
            info!("{} finished: {}", operation, names.join(" "));
        } else {
            error!(
                "{} failed ({}, exit code {:?}): {}",
                operation,
                report.state,
                report.exit_code,
                names.join(" ")
            );
        }
        Ok(report)
    }

    pub async fn execute_plan(
        &self,
        plan: &TransactionPlan,
        override_conflicts: bool,
        db: &DbHandle,
        lock: LockToken,
    ) -> InstallerResult<ExecutionReport> {
        if plan.snapshot != db.generation() {
            return Err(InstallerError::StalePlan {
                planned: plan.snapshot,
                current: db.generation(),
            });
        }
        self.execute(plan.operation, &plan.command_targets(), override_conflicts, lock)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, PackageInfo};
    use crate::lock::LockManager;
    use crate::planner::Planner;
    use tempfile::TempDir;

    fn executor(bin: &str) -> TransactionExecutor {
        TransactionExecutor::new(Arc::new(ProcessRunner::new("/bin/sh")), bin)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_command_shapes() {
        let exec = executor("pacman");
        assert_eq!(
            exec.build_command(Operation::Install, &names(&["foo", "bar"]), false)
                .unwrap(),
            "pacman -S --noconfirm foo bar"
        );
        assert_eq!(
            exec.build_command(Operation::Install, &names(&["qux"]), true)
                .unwrap(),
            "yes | pacman -S qux"
        );
        assert_eq!(
            exec.build_command(Operation::Remove, &names(&["bar", "baz"]), false)
                .unwrap(),
            "pacman -R --noconfirm bar baz"
        );

        let privileged = executor("pacman").with_privilege_command(Some("pkexec".into()));
        assert_eq!(
            privileged
                .build_command(Operation::Remove, &names(&["bar"]), true)
                .unwrap(),
            "yes | pkexec pacman -R bar"
        );
        assert_eq!(privileged.refresh_command("-Sy"), "pkexec pacman -Sy");
        assert_eq!(
            executor("pacman")
                .with_privilege_command(Some("  ".into()))
                .refresh_command("-Sy"),
            "pacman -Sy"
        );
    }

    #[test]
    fn test_build_command_rejects_unsafe_names() {
        let exec = executor("pacman");
        assert!(exec.build_command(Operation::Install, &names(&[]), false).is_err());
        assert!(exec
            .build_command(Operation::Install, &names(&["foo && reboot"]), false)
            .is_err());
        assert!(exec
            .build_command(Operation::Remove, &names(&["-Rns"]), false)
            .is_err());
    }

    #[tokio::test]
    async fn test_execute_success_releases_lock() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let lock = manager.acquire().unwrap();

        let report = executor("true")
            .execute(Operation::Install, &names(&["foo"]), false, lock)
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.command, "true -S --noconfirm foo");
        assert!(!manager.is_held());
    }

    #[tokio::test]
    async fn test_execute_failure_is_reported_and_releases_lock() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let lock = manager.acquire().unwrap();

        let report = executor("false")
            .execute(Operation::Remove, &names(&["bar"]), false, lock)
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.state, ProcessState::Failed);
        assert!(!manager.is_held());
        assert!(manager.acquire().is_ok());
    }

    #[tokio::test]
    async fn test_stale_plan_is_refused() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut db = DbHandle::in_memory(
            Database::new("local"),
            vec![Database::with_packages(
                "core",
                vec![PackageInfo::new("foo", "1.0-1")],
            )],
        );
        let plan = Planner::new().stage(Operation::Install, &names(&["foo"]), &db);
        db.refresh().unwrap();

        let lock = manager.acquire().unwrap();
        let err = executor("true")
            .execute_plan(&plan, false, &db, lock)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::StalePlan { .. }));
        assert!(!manager.is_held());
    }
}
