use crate::{
    config::Config,
    confirm::{Confirmation, ConfirmationGate},
    database::{DbHandle, InstalledSet},
    error::{InstallerError, InstallerResult},
    events::EventBus,
    executor::{ExecutionReport, TransactionExecutor},
    lock::{LockManager, LockToken},
    planner::{
        CommandRefresher, ConflictReport, Operation, Planner, SyncRefresher, TargetSet,
        TransactionPlan,
    },
    process::{ProcessEvent, ProcessRunner, ProcessState},
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LockAcquired,
    LockReleased,
    PlanReady {
        operation: Operation,
        targets: TargetSet,
        to_install: usize,
        to_remove: usize,
    },
    ConflictsDetected(Vec<ConflictReport>),
    Decision(Confirmation),
    ExecutionFinished {
        operation: Operation,
        success: bool,
        state: ProcessState,
    },
    ListsInvalidated,
}

#[derive(Debug, Clone)]
pub enum OperationOutcome {
    Executed(ExecutionReport),
    Rejected,
}

impl OperationOutcome {
    /// A declined confirmation counts as success: nothing went wrong.
    pub fn success(&self) -> bool {
        match self {
            OperationOutcome::Executed(report) => report.success,
            OperationOutcome::Rejected => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub ok: bool,
    pub message: Option<String>,
}

pub struct Session {
    db: DbHandle,
    locks: LockManager,
    runner: Arc<ProcessRunner>,
    planner: Planner,
    executor: TransactionExecutor,
    refresher: Arc<dyn SyncRefresher>,
    trial_sync: bool,
    cascade_depth: Option<usize>,
    events: EventBus<SessionEvent>,
    needs_refresh: bool,
}

impl Session {
    pub fn open(config: &Config) -> InstallerResult<Self> {
        let db = DbHandle::open(&config.database_dir(), &config.resolved_repositories())?;
        Ok(Self::new(config, db))
    }

    pub fn new(config: &Config, db: DbHandle) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.shell.clone()));
        let executor = TransactionExecutor::new(Arc::clone(&runner), config.pacman_bin.clone())
            .with_privilege_command(config.privilege_command.clone());
        let refresher: Arc<dyn SyncRefresher> = Arc::new(CommandRefresher::new(
            Arc::clone(&runner),
            executor.refresh_command(&config.refresh_args),
        ));

        let mut session = Self {
            db,
            locks: LockManager::new(&config.lock_file),
            runner,
            planner: Planner::new(),
            executor,
            refresher,
            trial_sync: config.trial_sync,
            cascade_depth: config.cascade_limit(),
            events: EventBus::new(),
            needs_refresh: false,
        };
        session.rebuild_planner();
        session
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn SyncRefresher>) -> Self {
        self.refresher = refresher;
        self.rebuild_planner();
        self
    }

    fn rebuild_planner(&mut self) {
        let planner = Planner::new().with_cascade_depth(self.cascade_depth);
        self.planner = if self.trial_sync {
            planner.with_trial_sync(Arc::clone(&self.refresher))
        } else {
            planner
        };
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn process_events(&self) -> UnboundedReceiver<ProcessEvent> {
        self.runner.subscribe()
    }

    pub fn runner(&self) -> Arc<ProcessRunner> {
        Arc::clone(&self.runner)
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn terminate(&self) -> InstallerResult<()> {
        self.runner.terminate()
    }

    fn ensure_lists_valid(&self) -> InstallerResult<()> {
        if self.needs_refresh {
            return Err(InstallerError::ListsInvalidated(
                "the last transaction was interrupted".into(),
            ));
        }
        Ok(())
    }

    fn acquire_lock(&self) -> InstallerResult<LockToken> {
        let token = self.locks.acquire()?;
        self.events.emit(SessionEvent::LockAcquired);
        Ok(token)
    }

    fn release_lock(&self, token: LockToken) {
        if let Err(e) = self.locks.release(token) {
            warn!("Failed to release lock: {}", e);
        }
        self.events.emit(SessionEvent::LockReleased);
    }

    fn announce_plan(&self, plan: &TransactionPlan) {
        self.events.emit(SessionEvent::PlanReady {
            operation: plan.operation,
            targets: plan.targets.clone(),
            to_install: plan.to_install.len(),
            to_remove: plan.to_remove.len(),
        });
        if plan.requires_override() {
            self.events
                .emit(SessionEvent::ConflictsDetected(plan.conflicts.clone()));
        }
    }

    pub async fn plan(
        &mut self,
        operation: Operation,
        targets: &[String],
    ) -> InstallerResult<TransactionPlan> {
        self.ensure_lists_valid()?;
        let mut lock = self.acquire_lock()?;
        let result = self
            .planner
            .plan(operation, targets, &mut self.db, &mut lock)
            .await;
        self.release_lock(lock);

        let plan = result?;
        self.announce_plan(&plan);
        Ok(plan)
    }

    /// Plan, confirm and execute as one cycle under a single lock token.
    pub async fn run_operation(
        &mut self,
        operation: Operation,
        targets: &[String],
        gate: &ConfirmationGate,
    ) -> InstallerResult<OperationOutcome> {
        self.ensure_lists_valid()?;
        let mut lock = self.acquire_lock()?;

        let plan = match self
            .planner
            .plan(operation, targets, &mut self.db, &mut lock)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                self.release_lock(lock);
                return Err(e);
            }
        };
        self.announce_plan(&plan);

        let confirmation = match gate.confirm(&plan).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                self.release_lock(lock);
                return Err(e);
            }
        };
        self.events.emit(SessionEvent::Decision(confirmation));
        if !confirmation.accepted() {
            self.release_lock(lock);
            return Ok(OperationOutcome::Rejected);
        }

        let result = self
            .executor
            .execute_plan(&plan, confirmation.override_conflicts, &self.db, lock)
            .await;
        self.events.emit(SessionEvent::LockReleased);
        let report = result?;

        self.events.emit(SessionEvent::ExecutionFinished {
            operation,
            success: report.success,
            state: report.state,
        });
        self.after_execution(&report);
        Ok(OperationOutcome::Executed(report))
    }

    pub async fn install(
        &mut self,
        targets: &[String],
        gate: &ConfirmationGate,
    ) -> InstallerResult<OperationOutcome> {
        self.run_operation(Operation::Install, targets, gate).await
    }

    pub async fn remove(
        &mut self,
        targets: &[String],
        gate: &ConfirmationGate,
    ) -> InstallerResult<OperationOutcome> {
        self.run_operation(Operation::Remove, targets, gate).await
    }

    fn after_execution(&mut self, report: &ExecutionReport) {
        if report.state == ProcessState::Terminated {
            warn!("Transaction interrupted, package lists must be refreshed");
            self.needs_refresh = true;
            self.events.emit(SessionEvent::ListsInvalidated);
            return;
        }
        if let Err(e) = self.db.refresh_local() {
            warn!("Failed to reload installed packages: {}", e);
            self.needs_refresh = true;
            self.events.emit(SessionEvent::ListsInvalidated);
        }
    }

    pub async fn update_sources(&mut self) -> InstallerResult<UpdateOutcome> {
        let mut lock = self.acquire_lock()?;
        let refresher = Arc::clone(&self.refresher);
        let refreshed = lock
            .release_during(move || async move { refresher.refresh().await })
            .await;
        self.release_lock(lock);

        match refreshed?.and_then(|()| self.db.refresh()) {
            Ok(()) => {
                info!("Package sources updated");
                self.needs_refresh = false;
                Ok(UpdateOutcome {
                    ok: true,
                    message: None,
                })
            }
            Err(e) => {
                error!("problem updating sources: {}", e);
                Ok(UpdateOutcome {
                    ok: false,
                    message: Some(e.to_string()),
                })
            }
        }
    }

    pub fn refresh_lists(&mut self) -> InstallerResult<InstalledSet> {
        self.db.refresh()?;
        self.needs_refresh = false;
        Ok(self.db.installed_set())
    }

    pub fn installed(&self) -> InstalledSet {
        self.db.installed_set()
    }

    /// True only when every name is installed; false for an empty list.
    pub fn check_installed<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.db.installed_set().contains_all(names)
    }

    pub fn close(self) {
        if self.runner.state() != ProcessState::Idle {
            warn!("Closing session while a process is {}", self.runner.state());
        }
        self.db.close();
    }
}
