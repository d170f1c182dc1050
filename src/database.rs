use crate::{
    error::{InstallerError, InstallerResult},
    version::DepSpec,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InstallReason {
    #[default]
    Explicit,
    Dependency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub repository: String,
    pub filename: Option<String>,
    pub download_size: u64,
    pub installed_size: u64,
    pub reason: InstallReason,
    pub groups: Vec<String>,
    pub depends: Vec<String>,
    pub provides: Vec<String>,
    pub conflicts: Vec<String>,
    pub replaces: Vec<String>,
}

impl PackageInfo {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn with_depends(mut self, depends: &[&str]) -> Self {
        self.depends = depends.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_provides(mut self, provides: &[&str]) -> Self {
        self.provides = provides.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_conflicts(mut self, conflicts: &[&str]) -> Self {
        self.conflicts = conflicts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_replaces(mut self, replaces: &[&str]) -> Self {
        self.replaces = replaces.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn with_sizes(mut self, download_size: u64, installed_size: u64) -> Self {
        self.download_size = download_size;
        self.installed_size = installed_size;
        self
    }

    pub fn satisfies(&self, dep: &DepSpec) -> bool {
        dep.satisfied_by(&self.name, &self.version, &self.provides)
    }

    pub fn merge_desc(&mut self, content: &str) {
        let mut lines = content.lines().peekable();

        while let Some(line) = lines.next() {
            let line = line.trim();
            if !(line.len() > 2 && line.starts_with('%') && line.ends_with('%')) {
                continue;
            }
            let field = &line[1..line.len() - 1];

            let mut values = Vec::new();
            while let Some(value) = lines.peek() {
                let value = value.trim();
                if value.is_empty() {
                    break;
                }
                values.push(value.to_string());
                lines.next();
            }
            let first = values.first().cloned().unwrap_or_default();

            match field {
                "NAME" => self.name = first,
                "VERSION" => self.version = first,
                "DESC" => self.description = first,
                "FILENAME" => self.filename = Some(first),
                "CSIZE" => self.download_size = parse_size(&self.name, field, &first),
                "ISIZE" | "SIZE" => self.installed_size = parse_size(&self.name, field, &first),
                "REASON" => {
                    self.reason = if first == "1" {
                        InstallReason::Dependency
                    } else {
                        InstallReason::Explicit
                    }
                }
                "GROUPS" => self.groups = values,
                "DEPENDS" => self.depends = values,
                "PROVIDES" => self.provides = values,
                "CONFLICTS" => self.conflicts = values,
                "REPLACES" => self.replaces = values,
                _ => {}
            }
        }
    }
}

fn parse_size(name: &str, field: &str, value: &str) -> u64 {
    value
        .parse()
        .map_err(|e| warn!("Failed to parse {} for {}: {}", field, name, e))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct Database {
    pub name: String,
    packages: BTreeMap<String, PackageInfo>,
}

impl Database {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            packages: BTreeMap::new(),
        }
    }

    pub fn with_packages(name: &str, packages: Vec<PackageInfo>) -> Self {
        let mut db = Self::new(name);
        for package in packages {
            db.insert(package);
        }
        db
    }

    pub fn insert(&mut self, mut package: PackageInfo) {
        package.repository = self.name.clone();
        self.packages.insert(package.name.clone(), package);
    }

    pub fn pkg(&self, name: &str) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn pkgs(&self) -> impl Iterator<Item = &PackageInfo> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn find_satisfier(&self, dep: &DepSpec) -> Option<&PackageInfo> {
        if let Some(package) = self.packages.get(&dep.name) {
            if package.satisfies(dep) {
                return Some(package);
            }
        }
        self.packages.values().find(|p| p.satisfies(dep))
    }

    fn load_local(dir: &Path) -> InstallerResult<Self> {
        let mut db = Self::new("local");
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let desc_file = entry.path().join("desc");
            if !desc_file.exists() {
                continue;
            }
            let mut package = PackageInfo::default();
            package.merge_desc(&std::fs::read_to_string(&desc_file)?);
            if package.name.is_empty() {
                warn!("Skipping local entry without a name: {}", entry.path().display());
                continue;
            }
            db.insert(package);
        }
        debug!("Loaded {} installed packages from {}", db.len(), dir.display());
        Ok(db)
    }

    fn load_sync(path: &Path, repo: &str) -> InstallerResult<Self> {
        let data = std::fs::read(path)?;
        let reader: Box<dyn Read + '_> = match data.as_slice() {
            [0x1f, 0x8b, ..] => Box::new(flate2::read::GzDecoder::new(data.as_slice())),
            [0x28, 0xb5, 0x2f, 0xfd, ..] => {
                Box::new(zstd::stream::read::Decoder::new(data.as_slice())?)
            }
            [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => {
                Box::new(xz2::read::XzDecoder::new(data.as_slice()))
            }
            _ => Box::new(data.as_slice()),
        };

        let mut sections: BTreeMap<String, String> = BTreeMap::new();
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            let file_name = entry_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if file_name != "desc" && file_name != "depends" {
                continue;
            }
            let Some(dir) = entry_path
                .parent()
                .and_then(|p| p.to_str())
                .filter(|p| !p.is_empty())
                .map(String::from)
            else {
                continue;
            };
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            let section = sections.entry(dir).or_default();
            section.push_str(&content);
            section.push('\n');
        }

        let mut db = Self::new(repo);
        for content in sections.values() {
            let mut package = PackageInfo::default();
            package.merge_desc(content);
            if !package.name.is_empty() {
                db.insert(package);
            }
        }
        debug!("Loaded {} packages from sync database {}", db.len(), repo);
        Ok(db)
    }
}

/// Snapshot of installed packages (name -> version). Replaced wholesale on
/// refresh, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledSet {
    packages: BTreeMap<String, String>,
    pub captured_at: DateTime<Utc>,
    pub generation: u64,
}

impl InstalledSet {
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn version(&self, name: &str) -> Option<&str> {
        self.packages.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.packages.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn contains_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        !names.is_empty() && names.iter().all(|n| self.contains(n.as_ref()))
    }
}

#[derive(Debug, Clone)]
enum DbSource {
    Disk {
        db_path: PathBuf,
        repositories: Vec<String>,
    },
    Memory,
}

#[derive(Debug)]
pub struct DbHandle {
    source: DbSource,
    local: Database,
    syncs: Vec<Database>,
    generation: u64,
}

impl DbHandle {
    pub fn open(db_path: &Path, repositories: &[String]) -> InstallerResult<Self> {
        if !db_path.is_dir() {
            return Err(InstallerError::DatabaseOpen(format!(
                "Database path does not exist: {}",
                db_path.display()
            )));
        }

        let local_dir = db_path.join("local");
        let local = Database::load_local(&local_dir).map_err(|e| {
            InstallerError::DatabaseOpen(format!("{}: {}", local_dir.display(), e))
        })?;

        let repositories = if repositories.is_empty() {
            discover_sync_repositories(db_path)?
        } else {
            repositories.to_vec()
        };

        let mut handle = Self {
            source: DbSource::Disk {
                db_path: db_path.to_path_buf(),
                repositories: repositories.clone(),
            },
            local,
            syncs: Vec::new(),
            generation: 1,
        };

        for repo in &repositories {
            match handle.load_repository(db_path, repo) {
                Ok(db) => handle.syncs.push(db),
                Err(e) => {
                    warn!("Failed to register sync database {}: {}", repo, e);
                    handle.syncs.push(Database::new(repo));
                }
            }
        }

        info!(
            "Opened package database at {} ({} installed, {} sync repositories)",
            db_path.display(),
            handle.local.len(),
            handle.syncs.len()
        );
        Ok(handle)
    }

    pub fn in_memory(local: Database, syncs: Vec<Database>) -> Self {
        Self {
            source: DbSource::Memory,
            local,
            syncs,
            generation: 1,
        }
    }

    fn load_repository(&self, db_path: &Path, repo: &str) -> InstallerResult<Database> {
        let path = db_path.join("sync").join(format!("{}.db", repo));
        if !path.exists() {
            debug!("Sync database {} has not been downloaded yet", repo);
            return Ok(Database::new(repo));
        }
        Database::load_sync(&path, repo)
    }

    /// Re-reads the on-disk databases after an external sync. In-memory handles
    /// keep their content but still move to a new snapshot.
    pub fn refresh(&mut self) -> InstallerResult<()> {
        if let DbSource::Disk {
            db_path,
            repositories,
        } = self.source.clone()
        {
            let local = Database::load_local(&db_path.join("local"))
                .map_err(|e| InstallerError::Sync(format!("local database: {}", e)))?;
            let mut syncs = Vec::with_capacity(repositories.len());
            for repo in &repositories {
                let db = self
                    .load_repository(&db_path, repo)
                    .map_err(|e| InstallerError::Sync(format!("{}: {}", repo, e)))?;
                syncs.push(db);
            }
            self.local = local;
            self.syncs = syncs;
        }
        self.generation += 1;
        debug!("Package database refreshed, snapshot {}", self.generation);
        Ok(())
    }

    pub fn refresh_local(&mut self) -> InstallerResult<()> {
        if let DbSource::Disk { db_path, .. } = &self.source {
            self.local = Database::load_local(&db_path.join("local"))?;
        }
        self.generation += 1;
        Ok(())
    }

    pub fn close(self) {
        debug!("Closing package database handle at snapshot {}", self.generation);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_database(&self) -> &Database {
        &self.local
    }

    pub fn synced_databases(&self) -> &[Database] {
        &self.syncs
    }

    pub fn lookup(&self, name: &str) -> Option<&PackageInfo> {
        self.lookup_sync(name).or_else(|| self.local.pkg(name))
    }

    pub fn lookup_sync(&self, name: &str) -> Option<&PackageInfo> {
        self.syncs.iter().find_map(|db| db.pkg(name))
    }

    pub fn lookup_installed(&self, name: &str) -> Option<&PackageInfo> {
        self.local.pkg(name)
    }

    pub fn find_sync_satisfier(&self, dep: &DepSpec) -> Option<&PackageInfo> {
        self.syncs.iter().find_map(|db| db.find_satisfier(dep))
    }

    pub fn installed_set(&self) -> InstalledSet {
        InstalledSet {
            packages: self
                .local
                .pkgs()
                .map(|p| (p.name.clone(), p.version.clone()))
                .collect(),
            captured_at: Utc::now(),
            generation: self.generation,
        }
    }
}

fn discover_sync_repositories(db_path: &Path) -> InstallerResult<Vec<String>> {
    let sync_dir = db_path.join("sync");
    if !sync_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut repos = Vec::new();
    for entry in std::fs::read_dir(&sync_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("db") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                repos.push(stem.to_string());
            }
        }
    }
    repos.sort();
    Ok(repos)
}

pub fn parse_pacman_conf_repositories(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('[') && line.ends_with(']'))
        .map(|line| line[1..line.len() - 1].trim().to_string())
        .filter(|name| !name.is_empty() && name != "options")
        .collect()
}
