use crate::{
    database::parse_pacman_conf_repositories,
    error::{InstallerError, InstallerResult},
    PKGINSTALL_CONFIG, PKGINSTALL_DATA,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "PKGINSTALL_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_pacman_conf")]
    pub pacman_conf: PathBuf,

    #[serde(default)]
    pub repositories: Vec<String>,

    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default = "default_pacman_bin")]
    pub pacman_bin: String,

    #[serde(default)]
    pub privilege_command: Option<String>,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_refresh_args")]
    pub refresh_args: String,

    #[serde(default = "default_trial_sync")]
    pub trial_sync: bool,

    #[serde(default = "default_cascade_depth")]
    pub cascade_depth: usize,

    #[serde(default)]
    pub full_cascade: bool,
}

impl Config {
    /// Loads from `config_path`, `$PKGINSTALL_CONFIG`, or the default location,
    /// in that order. A missing file yields the defaults, which are written
    /// back when possible.
    pub fn load(config_path: Option<&Path>) -> InstallerResult<Self> {
        let config_path = match config_path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) if !path.is_empty() => PathBuf::from(path),
                _ => PKGINSTALL_CONFIG.join("pkginstall.toml"),
            },
        };

        if config_path.is_file() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content).map_err(|e| {
                InstallerError::ConfigError(format!("{}: {}", config_path.display(), e))
            })?;
            debug!("Loaded configuration from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            if let Err(e) = config.save(&config_path) {
                warn!(
                    "Using default configuration, could not write {}: {}",
                    config_path.display(),
                    e
                );
            }
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> InstallerResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn database_dir(&self) -> PathBuf {
        rooted(&self.root_dir, &self.db_path)
    }

    pub fn resolved_repositories(&self) -> Vec<String> {
        if !self.repositories.is_empty() {
            return self.repositories.clone();
        }
        let conf = rooted(&self.root_dir, &self.pacman_conf);
        match std::fs::read_to_string(&conf) {
            Ok(content) => parse_pacman_conf_repositories(&content),
            Err(e) => {
                debug!("Cannot read {}: {}", conf.display(), e);
                Vec::new()
            }
        }
    }

    pub fn cascade_limit(&self) -> Option<usize> {
        if self.full_cascade {
            None
        } else {
            Some(self.cascade_depth)
        }
    }
}

fn rooted(root: &Path, path: &Path) -> PathBuf {
    if root == Path::new("/") {
        path.to_path_buf()
    } else {
        root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            db_path: default_db_path(),
            pacman_conf: default_pacman_conf(),
            repositories: Vec::new(),
            lock_file: default_lock_file(),
            pacman_bin: default_pacman_bin(),
            privilege_command: None,
            shell: default_shell(),
            refresh_args: default_refresh_args(),
            trial_sync: default_trial_sync(),
            cascade_depth: default_cascade_depth(),
            full_cascade: false,
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/pacman")
}

fn default_pacman_conf() -> PathBuf {
    PathBuf::from("/etc/pacman.conf")
}

fn default_lock_file() -> PathBuf {
    if unsafe { libc::geteuid() } == 0 {
        PathBuf::from("/run/lock/pkginstall.lock")
    } else {
        PKGINSTALL_DATA.join("pkginstall.lock")
    }
}

fn default_pacman_bin() -> String {
    "pacman".to_string()
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_refresh_args() -> String {
    "-Sy".to_string()
}

fn default_trial_sync() -> bool {
    true
}

fn default_cascade_depth() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/pacman"));
        assert_eq!(config.cascade_limit(), Some(1));
        assert!(config.trial_sync);
        assert_eq!(config.refresh_args, "-Sy");
        assert_eq!(config.privilege_command, None);
    }

    #[test]
    fn test_missing_file_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("pkginstall.toml");
        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load(Some(path.as_path())).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pkginstall.toml");
        std::fs::write(
            &path,
            "privilege_command = \"pkexec\"\nfull_cascade = true\nrepositories = [\"extra\", \"core\"]\n",
        )
        .unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.pacman_bin, "pacman");
        assert_eq!(config.cascade_limit(), None);
        assert_eq!(config.privilege_command.as_deref(), Some("pkexec"));
        assert_eq!(config.resolved_repositories(), vec!["extra", "core"]);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pkginstall.toml");
        std::fs::write(&path, "trial_sync = \"sometimes\"").unwrap();
        let err = Config::load(Some(path.as_path())).unwrap_err();
        assert!(matches!(err, InstallerError::ConfigError(_)));
    }

    #[test]
    fn test_repositories_from_pacman_conf_under_root() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("etc")).unwrap();
        std::fs::write(
            temp.path().join("etc/pacman.conf"),
            "[options]\n[cachyos]\n[core]\n[extra]\n",
        )
        .unwrap();

        let config = Config {
            root_dir: temp.path().to_path_buf(),
            ..Config::default()
        };
        assert_eq!(config.resolved_repositories(), vec!["cachyos", "core", "extra"]);
        assert_eq!(config.database_dir(), temp.path().join("var/lib/pacman"));
    }
}
