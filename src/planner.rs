use crate::{
    database::{DbHandle, PackageInfo},
    error::{InstallerError, InstallerResult},
    lock::LockToken,
    process::ProcessRunner,
    utils::{format_signed_size, format_size, validate_package_names},
    version::DepSpec,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Install => f.write_str("install"),
            Operation::Remove => f.write_str("remove"),
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Operation::Install),
            "remove" => Ok(Operation::Remove),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

pub type TargetSet = Vec<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConflictKind {
    NotFound,
    Unsatisfiable,
    PackageConflict,
    Replaces,
    BrokenDependent,
    TrialSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub package: String,
    pub other: Option<String>,
    pub kind: ConflictKind,
    pub message: String,
}

impl ConflictReport {
    pub fn new(kind: ConflictKind, package: &str, other: Option<&str>, message: String) -> Self {
        Self {
            package: package.to_string(),
            other: other.map(String::from),
            kind,
            message,
        }
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn format_conflicts(conflicts: &[ConflictReport]) -> String {
    conflicts
        .iter()
        .map(|c| c.message.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub ok: bool,
    pub message: Option<String>,
}

impl TrialOutcome {
    pub fn passed() -> Self {
        Self {
            ok: true,
            message: None,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            ok: false,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPlan {
    pub operation: Operation,
    pub targets: TargetSet,
    pub to_install: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
    pub conflicts: Vec<ConflictReport>,
    pub summary_text: String,
    pub details_text: String,
    pub download_size: u64,
    pub installed_delta: i64,
    pub snapshot: u64,
    pub trial: Option<TrialOutcome>,
}

impl TransactionPlan {
    pub fn requires_override(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.to_install.is_empty() && self.to_remove.is_empty()
    }

    /// Names handed to the package manager: the requested targets for an
    /// install, the whole resolved removal set for a remove.
    pub fn command_targets(&self) -> Vec<String> {
        match self.operation {
            Operation::Install => self.targets.clone(),
            Operation::Remove => self.to_remove.iter().cloned().collect(),
        }
    }
}

#[async_trait]
pub trait SyncRefresher: Send + Sync {
    async fn refresh(&self) -> InstallerResult<()>;
}

pub struct CommandRefresher {
    runner: Arc<ProcessRunner>,
    command: String,
}

impl CommandRefresher {
    pub fn new<S: Into<String>>(runner: Arc<ProcessRunner>, command: S) -> Self {
        Self {
            runner,
            command: command.into(),
        }
    }
}

#[async_trait]
impl SyncRefresher for CommandRefresher {
    async fn refresh(&self) -> InstallerResult<()> {
        let outcome = self.runner.run(&self.command).await?;
        if outcome.success() {
            Ok(())
        } else {
            Err(InstallerError::Sync(format!(
                "'{}' ended {} (exit code {:?}) {}",
                self.command,
                outcome.state,
                outcome.exit_code,
                outcome.output_tail(3)
            )))
        }
    }
}

struct StagedTransaction<'a> {
    db: &'a DbHandle,
    add: BTreeMap<String, &'a PackageInfo>,
    remove: BTreeMap<String, &'a PackageInfo>,
    conflicts: Vec<ConflictReport>,
    reported: BTreeSet<(ConflictKind, String, String)>,
}

struct BrokenDependency<'a> {
    dependent: &'a PackageInfo,
    dependency: String,
    provider: String,
}

impl<'a> StagedTransaction<'a> {
    fn new(db: &'a DbHandle) -> Self {
        Self {
            db,
            add: BTreeMap::new(),
            remove: BTreeMap::new(),
            conflicts: Vec::new(),
            reported: BTreeSet::new(),
        }
    }

    fn report(&mut self, kind: ConflictKind, package: &str, other: Option<&str>, message: String) {
        let key = match (kind, other) {
            (ConflictKind::PackageConflict, Some(other)) if other < package => {
                (kind, other.to_string(), package.to_string())
            }
            _ => (
                kind,
                package.to_string(),
                other.unwrap_or_default().to_string(),
            ),
        };
        if self.reported.insert(key) {
            debug!("Conflict: {}", message);
            self.conflicts
                .push(ConflictReport::new(kind, package, other, message));
        }
    }

    fn add_install_target(&mut self, name: &str) {
        if self.add.contains_key(name) {
            return;
        }
        let db = self.db;
        let found = db
            .lookup_sync(name)
            .or_else(|| db.find_sync_satisfier(&DepSpec::parse(name)));
        match found {
            Some(package) => {
                self.add.insert(package.name.clone(), package);
            }
            None => self.report(
                ConflictKind::NotFound,
                name,
                None,
                format!("target not found: {}", name),
            ),
        }
    }

    fn add_remove_target(&mut self, name: &str) {
        match self.db.lookup_installed(name) {
            Some(package) => {
                self.remove.insert(package.name.clone(), package);
            }
            None => self.report(
                ConflictKind::NotFound,
                name,
                None,
                format!("target not found: {} is not installed", name),
            ),
        }
    }

    fn remains_installed(&self, package: &PackageInfo) -> bool {
        !self.remove.contains_key(&package.name) && !self.add.contains_key(&package.name)
    }

    fn satisfied_after(&self, dep: &DepSpec) -> bool {
        self.add.values().any(|p| p.satisfies(dep))
            || self
                .db
                .local_database()
                .pkgs()
                .any(|p| self.remains_installed(p) && p.satisfies(dep))
    }

    fn resolve_dependencies(&mut self) {
        let db = self.db;
        let mut queue: Vec<&'a PackageInfo> = self.add.values().copied().collect();

        while let Some(package) = queue.pop() {
            for raw in &package.depends {
                let dep = DepSpec::parse(raw);
                if self.satisfied_after(&dep) {
                    continue;
                }
                match db.find_sync_satisfier(&dep) {
                    Some(provider) => {
                        debug!("{} pulls in {} for {}", package.name, provider.name, raw);
                        self.add.insert(provider.name.clone(), provider);
                        queue.push(provider);
                    }
                    None => self.report(
                        ConflictKind::Unsatisfiable,
                        &package.name,
                        Some(&dep.name),
                        format!(
                            "unable to satisfy dependency '{}' required by {}",
                            raw, package.name
                        ),
                    ),
                }
            }
        }
    }

    fn schedule_replacement(
        &mut self,
        kind: ConflictKind,
        package: &PackageInfo,
        installed: &'a PackageInfo,
        message: String,
    ) {
        self.remove.insert(installed.name.clone(), installed);
        self.report(kind, &package.name, Some(&installed.name), message);
    }

    fn detect_conflicts(&mut self) {
        let new: Vec<&'a PackageInfo> = self.add.values().copied().collect();
        let installed: Vec<&'a PackageInfo> = self
            .db
            .local_database()
            .pkgs()
            .filter(|p| !self.add.contains_key(&p.name))
            .collect();

        for &package in &new {
            for raw in &package.conflicts {
                let spec = DepSpec::parse(raw);
                for &other in new.iter().filter(|o| o.name != package.name) {
                    if other.satisfies(&spec) {
                        self.report(
                            ConflictKind::PackageConflict,
                            &package.name,
                            Some(&other.name),
                            format!("{} and {} are in conflict", package.name, other.name),
                        );
                    }
                }
                for &existing in installed.iter().filter(|i| i.name != package.name) {
                    if existing.satisfies(&spec) {
                        self.schedule_replacement(
                            ConflictKind::PackageConflict,
                            package,
                            existing,
                            format!(
                                "{} and {} are in conflict ({} will be removed)",
                                package.name, existing.name, existing.name
                            ),
                        );
                    }
                }
            }

            for &existing in installed.iter().filter(|i| i.name != package.name) {
                let declared = existing
                    .conflicts
                    .iter()
                    .any(|raw| package.satisfies(&DepSpec::parse(raw)));
                if declared {
                    self.schedule_replacement(
                        ConflictKind::PackageConflict,
                        package,
                        existing,
                        format!(
                            "installed {} conflicts with {} ({} will be removed)",
                            existing.name, package.name, existing.name
                        ),
                    );
                }
            }

            for raw in &package.replaces {
                let spec = DepSpec::parse(raw);
                for &existing in installed.iter().filter(|i| i.name != package.name) {
                    if existing.satisfies(&spec) {
                        self.schedule_replacement(
                            ConflictKind::Replaces,
                            package,
                            existing,
                            format!("{} replaces installed {}", package.name, existing.name),
                        );
                    }
                }
            }
        }
    }

    /// Installed packages left in place whose dependencies stop holding,
    /// paired with the removed or upgraded package that satisfied them.
    /// Dependencies that were already unsatisfied are not blamed on the
    /// transaction.
    fn broken_dependencies(&self) -> Vec<BrokenDependency<'a>> {
        let db = self.db;
        let mut broken = Vec::new();
        for dependent in db.local_database().pkgs() {
            if !self.remains_installed(dependent) {
                continue;
            }
            for raw in &dependent.depends {
                let dep = DepSpec::parse(raw);
                if self.satisfied_after(&dep) {
                    continue;
                }
                let Some(provider) = db
                    .local_database()
                    .pkgs()
                    .find(|p| !self.remains_installed(p) && p.satisfies(&dep))
                else {
                    continue;
                };
                broken.push(BrokenDependency {
                    dependent,
                    dependency: raw.clone(),
                    provider: provider.name.clone(),
                });
                break;
            }
        }
        broken
    }

    fn report_broken(&mut self, broken: Vec<BrokenDependency<'a>>) {
        for b in broken {
            let change = match self.add.get(&b.provider) {
                Some(upgrade) => format!("upgrading {} to {}", b.provider, upgrade.version),
                None => format!("removing {}", b.provider),
            };
            self.report(
                ConflictKind::BrokenDependent,
                &b.dependent.name,
                Some(&b.provider),
                format!(
                    "{} breaks dependency '{}' required by {}",
                    change, b.dependency, b.dependent.name
                ),
            );
        }
    }

    fn check_new_dependencies(&mut self) {
        let new: Vec<&'a PackageInfo> = self.add.values().copied().collect();
        for package in new {
            for raw in &package.depends {
                let dep = DepSpec::parse(raw);
                if !self.satisfied_after(&dep) {
                    self.report(
                        ConflictKind::Unsatisfiable,
                        &package.name,
                        Some(&dep.name),
                        format!(
                            "unable to satisfy dependency '{}' required by {}",
                            raw, package.name
                        ),
                    );
                }
            }
        }
    }

    /// Pulls reverse dependents into the removal set level by level. `None`
    /// follows the chain to the end.
    fn resolve_cascade(&mut self, depth: Option<usize>) {
        let mut level = 0;
        loop {
            let broken = self.broken_dependencies();
            if broken.is_empty() {
                break;
            }
            if depth.is_some_and(|limit| level >= limit) {
                self.report_broken(broken);
                break;
            }
            for b in broken {
                debug!("{} depends on {}, removing it too", b.dependent.name, b.provider);
                self.remove.insert(b.dependent.name.clone(), b.dependent);
            }
            level += 1;
        }
    }

    fn release(self, operation: Operation, targets: &[String]) -> TransactionPlan {
        let download_size: u64 = self.add.values().map(|p| p.download_size).sum();
        let mut installed_delta: i64 = 0;
        for package in self.add.values() {
            installed_delta += package.installed_size as i64;
            if let Some(old) = self.db.lookup_installed(&package.name) {
                installed_delta -= old.installed_size as i64;
            }
        }
        for package in self.remove.values() {
            installed_delta -= package.installed_size as i64;
        }

        let mut summary = vec![
            format!("Packages to install: {}", self.add.len()),
            format!("Packages to remove: {}", self.remove.len()),
            format!("Total: {}", self.add.len() + self.remove.len()),
        ];
        if !self.add.is_empty() {
            summary.push(format!("Download size: {}", format_size(download_size)));
        }
        summary.push(format!(
            "Net installed size: {}",
            format_signed_size(installed_delta)
        ));

        let install_section = section("Install", self.add.values().copied());
        let remove_section = section("Remove", self.remove.values().copied());
        let ordered = match operation {
            Operation::Install => [install_section, remove_section],
            Operation::Remove => [remove_section, install_section],
        };
        let details_text = ordered
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        debug!("Released staged {} transaction without commit", operation);
        TransactionPlan {
            operation,
            targets: targets.to_vec(),
            to_install: self.add.keys().cloned().collect(),
            to_remove: self.remove.keys().cloned().collect(),
            conflicts: self.conflicts,
            summary_text: summary.join("\n"),
            details_text,
            download_size,
            installed_delta,
            snapshot: self.db.generation(),
            trial: None,
        }
    }
}

fn section<'p>(title: &str, packages: impl Iterator<Item = &'p PackageInfo>) -> String {
    let lines: Vec<String> = packages
        .map(|p| format!("  {} {}", p.name, p.version))
        .collect();
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n{}", title, lines.join("\n"))
    }
}

fn check_downloads(plan: &TransactionPlan, db: &DbHandle) -> TrialOutcome {
    let missing: Vec<&str> = plan
        .to_install
        .iter()
        .filter(|name| db.lookup_sync(name).and_then(|p| p.filename.as_ref()).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        TrialOutcome::passed()
    } else {
        TrialOutcome::failed(format!("no download available for: {}", missing.join(", ")))
    }
}

pub struct Planner {
    cascade_depth: Option<usize>,
    refresher: Option<Arc<dyn SyncRefresher>>,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            cascade_depth: Some(1),
            refresher: None,
        }
    }

    pub fn with_cascade_depth(mut self, depth: Option<usize>) -> Self {
        self.cascade_depth = depth;
        self
    }

    pub fn with_trial_sync(mut self, refresher: Arc<dyn SyncRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Resolves `targets` against the current snapshot. Pure: calling it twice
    /// without an intervening change yields the same plan.
    pub fn stage(&self, operation: Operation, targets: &[String], db: &DbHandle) -> TransactionPlan {
        let mut tx = StagedTransaction::new(db);
        match operation {
            Operation::Install => {
                for target in targets {
                    tx.add_install_target(target);
                }
                tx.resolve_dependencies();
                tx.detect_conflicts();
                tx.check_new_dependencies();
                let broken = tx.broken_dependencies();
                tx.report_broken(broken);
            }
            Operation::Remove => {
                for target in targets {
                    tx.add_remove_target(target);
                }
                tx.resolve_cascade(self.cascade_depth);
            }
        }
        tx.release(operation, targets)
    }

    pub async fn plan(
        &self,
        operation: Operation,
        targets: &[String],
        db: &mut DbHandle,
        lock: &mut LockToken,
    ) -> InstallerResult<TransactionPlan> {
        if !lock.is_locked() {
            return Err(InstallerError::DatabaseLock(
                "planning requires the database lock".into(),
            ));
        }
        if targets.is_empty() {
            return Err(InstallerError::InvalidPackageName("no targets given".into()));
        }
        validate_package_names(targets)?;

        let mut plan = self.stage(operation, targets, db);
        if operation == Operation::Install {
            if let Some(refresher) = &self.refresher {
                plan = self
                    .trial_sync(Arc::clone(refresher), targets, db, lock)
                    .await?;
            }
        }

        info!(
            "Planned {} of {}: {} to install, {} to remove, {} conflicts",
            operation,
            targets.join(" "),
            plan.to_install.len(),
            plan.to_remove.len(),
            plan.conflicts.len()
        );
        Ok(plan)
    }

    async fn trial_sync(
        &self,
        refresher: Arc<dyn SyncRefresher>,
        targets: &[String],
        db: &mut DbHandle,
        lock: &mut LockToken,
    ) -> InstallerResult<TransactionPlan> {
        let refreshed = lock
            .release_during(move || async move { refresher.refresh().await })
            .await?;

        let outcome = match refreshed.and_then(|()| db.refresh()) {
            Ok(()) => None,
            Err(e) => {
                warn!("Trial synchronization failed: {}", e);
                Some(TrialOutcome::failed(
                    InstallerError::SyncTrial(e.to_string()).to_string(),
                ))
            }
        };

        let mut plan = self.stage(Operation::Install, targets, db);
        let outcome = outcome.unwrap_or_else(|| check_downloads(&plan, db));
        if let Some(message) = outcome.message.clone().filter(|_| !outcome.ok) {
            plan.conflicts.push(ConflictReport::new(
                ConflictKind::TrialSync,
                &targets.join(" "),
                None,
                message,
            ));
        }
        plan.trial = Some(outcome);
        Ok(plan)
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::lock::LockManager;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn targets(names: &[&str]) -> TargetSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn fixture() -> DbHandle {
        let local = Database::with_packages(
            "local",
            vec![
                PackageInfo::new("bash", "5.2-1").with_provides(&["sh"]),
                PackageInfo::new("quux", "2.0-1").with_sizes(0, 4096),
                PackageInfo::new("bar", "1.0-1"),
                PackageInfo::new("baz", "1.0-1").with_depends(&["bar"]),
                PackageInfo::new("top", "1.0-1").with_depends(&["baz>=1.0"]),
                PackageInfo::new("oldtool", "0.9-1"),
                PackageInfo::new("strict", "1.0-1").with_conflicts(&["jealous"]),
            ],
        );
        let core = Database::with_packages(
            "core",
            vec![
                PackageInfo::new("foo", "1.0-1")
                    .with_filename("foo-1.0-1-x86_64.pkg.tar.zst")
                    .with_sizes(1024, 4096),
                PackageInfo::new("app", "2.0-1")
                    .with_depends(&["lib>=1.1", "sh"])
                    .with_filename("app-2.0-1-x86_64.pkg.tar.zst"),
                PackageInfo::new("lib", "1.2-1").with_filename("lib-1.2-1-x86_64.pkg.tar.zst"),
                PackageInfo::new("qux", "1.0-1")
                    .with_conflicts(&["quux"])
                    .with_filename("qux-1.0-1-x86_64.pkg.tar.zst"),
                PackageInfo::new("needy", "1.0-1").with_depends(&["ghost"]),
                PackageInfo::new("newtool", "1.0-1")
                    .with_replaces(&["oldtool"])
                    .with_filename("newtool-1.0-1-x86_64.pkg.tar.zst"),
                PackageInfo::new("jealous", "1.0-1"),
                PackageInfo::new("nofile", "1.0-1"),
            ],
        );
        DbHandle::in_memory(local, vec![core])
    }

    struct StaticRefresher {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncRefresher for StaticRefresher {
        async fn refresh(&self) -> InstallerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(InstallerError::Sync("mirror unreachable".into()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_install_single_package() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Install, &targets(&["foo"]), &db);
        assert_eq!(plan.to_install, BTreeSet::from(["foo".to_string()]));
        assert!(plan.to_remove.is_empty());
        assert!(plan.conflicts.is_empty());
        assert!(!plan.requires_override());
        assert!(plan.summary_text.contains("Packages to install: 1"));
        assert!(plan.summary_text.contains("Total: 1"));
        assert!(plan.summary_text.contains("Download size: 1.0 KB"));
        assert_eq!(plan.details_text, "Install\n  foo 1.0-1");
        assert_eq!(plan.command_targets(), vec!["foo"]);
        assert_eq!(plan.snapshot, db.generation());
    }

    #[test]
    fn test_install_pulls_dependencies() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Install, &targets(&["app"]), &db);
        // sh is provided by the installed bash
        assert_eq!(
            plan.to_install,
            BTreeSet::from(["app".to_string(), "lib".to_string()])
        );
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.command_targets(), vec!["app"]);
    }

    #[test]
    fn test_planning_is_idempotent() {
        let db = fixture();
        let planner = Planner::new();
        for names in [&["app", "qux"][..], &["newtool"][..], &["foo", "missing"][..]] {
            let first = planner.stage(Operation::Install, &targets(names), &db);
            let second = planner.stage(Operation::Install, &targets(names), &db);
            assert_eq!(first, second);
        }
        let first = planner.stage(Operation::Remove, &targets(&["bar"]), &db);
        let second = planner.stage(Operation::Remove, &targets(&["bar"]), &db);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_and_unsatisfiable_are_conflicts() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Install, &targets(&["missing", "needy"]), &db);
        let kinds: Vec<ConflictKind> = plan.conflicts.iter().map(|c| c.kind).collect();
        assert!(kinds.contains(&ConflictKind::NotFound));
        assert!(kinds.contains(&ConflictKind::Unsatisfiable));
        assert!(format_conflicts(&plan.conflicts).contains("ghost"));
        assert!(plan.requires_override());
    }

    #[test]
    fn test_conflict_with_installed_package_schedules_removal() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Install, &targets(&["qux"]), &db);
        assert_eq!(plan.to_install, BTreeSet::from(["qux".to_string()]));
        assert_eq!(plan.to_remove, BTreeSet::from(["quux".to_string()]));
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].kind, ConflictKind::PackageConflict);
        assert_eq!(plan.conflicts[0].other.as_deref(), Some("quux"));
        assert!(plan.details_text.starts_with("Install\n  qux 1.0-1\nRemove\n  quux 2.0-1"));
        assert_eq!(plan.installed_delta, -4096);
    }

    #[test]
    fn test_installed_side_conflict_and_replaces() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Install, &targets(&["jealous", "newtool"]), &db);
        assert!(plan.to_remove.contains("strict"));
        assert!(plan.to_remove.contains("oldtool"));
        assert!(plan
            .conflicts
            .iter()
            .any(|c| c.kind == ConflictKind::Replaces && c.package == "newtool"));
    }

    #[test]
    fn test_upgrade_breaking_installed_dependent_is_a_conflict() {
        let local = Database::with_packages(
            "local",
            vec![
                PackageInfo::new("libz", "1.0-1").with_provides(&["libz.so=1"]),
                PackageInfo::new("app", "1.0-1").with_depends(&["libz<2"]),
                PackageInfo::new("viewer", "1.0-1").with_depends(&["libz.so=1"]),
                PackageInfo::new("loose", "1.0-1").with_depends(&["libz"]),
            ],
        );
        let core = Database::with_packages(
            "core",
            vec![PackageInfo::new("libz", "2.0-1").with_filename("libz-2.0-1-x86_64.pkg.tar.zst")],
        );
        let db = DbHandle::in_memory(local, vec![core]);

        let plan = Planner::new().stage(Operation::Install, &targets(&["libz"]), &db);
        assert_eq!(plan.to_install, BTreeSet::from(["libz".to_string()]));
        assert!(plan.to_remove.is_empty());
        let broken: Vec<&str> = plan
            .conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::BrokenDependent)
            .map(|c| c.package.as_str())
            .collect();
        assert_eq!(broken, vec!["app", "viewer"]);
        assert!(plan.conflicts.iter().all(|c| c.other.as_deref() == Some("libz")));
        assert!(format_conflicts(&plan.conflicts).contains("upgrading libz to 2.0-1"));
        assert!(plan.requires_override());
    }

    #[test]
    fn test_dependency_lost_to_conflict_replacement_is_unsatisfiable() {
        let local = Database::with_packages(
            "local",
            vec![PackageInfo::new("bash", "5.2-1").with_provides(&["sh"])],
        );
        let core = Database::with_packages(
            "core",
            vec![
                PackageInfo::new("tool", "1.0-1")
                    .with_depends(&["sh"])
                    .with_conflicts(&["bash"])
                    .with_filename("tool-1.0-1-x86_64.pkg.tar.zst"),
            ],
        );
        let db = DbHandle::in_memory(local, vec![core]);

        let plan = Planner::new().stage(Operation::Install, &targets(&["tool"]), &db);
        assert_eq!(plan.to_remove, BTreeSet::from(["bash".to_string()]));
        assert!(plan.conflicts.iter().any(|c| c.kind == ConflictKind::Unsatisfiable
            && c.package == "tool"
            && c.other.as_deref() == Some("sh")));
    }

    #[test]
    fn test_remove_cascades_to_direct_dependents() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Remove, &targets(&["bar"]), &db);
        assert_eq!(
            plan.to_remove,
            BTreeSet::from(["bar".to_string(), "baz".to_string()])
        );
        // top needs baz but sits beyond the cascade depth
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].kind, ConflictKind::BrokenDependent);
        assert_eq!(plan.conflicts[0].package, "top");
        assert!(plan.details_text.starts_with("Remove\n"));
        assert!(plan.summary_text.contains("Packages to remove: 2"));
        assert_eq!(plan.command_targets(), vec!["bar", "baz"]);
    }

    #[test]
    fn test_remove_full_cascade() {
        let db = fixture();
        let plan = Planner::new()
            .with_cascade_depth(None)
            .stage(Operation::Remove, &targets(&["bar"]), &db);
        assert_eq!(plan.to_remove.len(), 3);
        assert!(plan.conflicts.is_empty());

        let none = Planner::new()
            .with_cascade_depth(Some(0))
            .stage(Operation::Remove, &targets(&["bar"]), &db);
        assert_eq!(none.to_remove, BTreeSet::from(["bar".to_string()]));
        assert_eq!(none.conflicts[0].package, "baz");
    }

    #[test]
    fn test_remove_not_installed() {
        let db = fixture();
        let plan = Planner::new().stage(Operation::Remove, &targets(&["foo"]), &db);
        assert!(plan.to_remove.is_empty());
        assert_eq!(plan.conflicts[0].kind, ConflictKind::NotFound);
    }

    #[tokio::test]
    async fn test_plan_with_trial_sync_moves_to_new_snapshot() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut lock = manager.acquire().unwrap();
        let mut db = fixture();
        let before = db.generation();

        let refresher = Arc::new(StaticRefresher {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let planner = Planner::new().with_trial_sync(refresher.clone());
        let plan = planner
            .plan(Operation::Install, &targets(&["foo"]), &mut db, &mut lock)
            .await
            .unwrap();

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(plan.trial, Some(TrialOutcome::passed()));
        assert!(plan.snapshot > before);
        assert_eq!(plan.snapshot, db.generation());
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn test_failed_trial_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut lock = manager.acquire().unwrap();
        let mut db = fixture();

        let refresher = Arc::new(StaticRefresher {
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let planner = Planner::new().with_trial_sync(refresher);
        let plan = planner
            .plan(Operation::Install, &targets(&["foo"]), &mut db, &mut lock)
            .await
            .unwrap();

        let trial = plan.trial.clone().unwrap();
        assert!(!trial.ok);
        assert!(trial.message.unwrap().contains("mirror unreachable"));
        assert_eq!(plan.conflicts.last().unwrap().kind, ConflictKind::TrialSync);
        assert!(lock.is_locked());
        assert!(manager.is_held());
    }

    #[tokio::test]
    async fn test_trial_requires_download_entry() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut lock = manager.acquire().unwrap();
        let mut db = fixture();

        let refresher = Arc::new(StaticRefresher {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let plan = Planner::new()
            .with_trial_sync(refresher)
            .plan(Operation::Install, &targets(&["nofile"]), &mut db, &mut lock)
            .await
            .unwrap();
        assert!(plan.requires_override());
        assert!(plan.conflicts[0].message.contains("nofile"));
    }

    #[tokio::test]
    async fn test_remove_skips_trial_and_rejects_bad_names() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut lock = manager.acquire().unwrap();
        let mut db = fixture();
        let refresher = Arc::new(StaticRefresher {
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let planner = Planner::new().with_trial_sync(refresher.clone());

        let plan = planner
            .plan(Operation::Remove, &targets(&["oldtool"]), &mut db, &mut lock)
            .await
            .unwrap();
        assert!(plan.trial.is_none());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);

        let err = planner
            .plan(Operation::Install, &targets(&["foo; rm -rf /"]), &mut db, &mut lock)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::InvalidPackageName(_)));
    }
}
