use crate::error::{InstallerError, InstallerResult};
use fs2::FileExt;
use log::{debug, info, warn};
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    outstanding: Arc<AtomicBool>,
}

impl LockManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            outstanding: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Takes the lock without blocking. Fails with `DatabaseLock` when this
    /// process already holds a token and `LockBusy` when another process does.
    pub fn acquire(&self) -> InstallerResult<LockToken> {
        if self.outstanding.swap(true, Ordering::SeqCst) {
            return Err(InstallerError::DatabaseLock(format!(
                "lock {} is already held by this process",
                self.path.display()
            )));
        }

        match self.lock_file() {
            Ok(file) => {
                info!("Acquired package database lock at {}", self.path.display());
                Ok(LockToken {
                    file,
                    path: self.path.clone(),
                    outstanding: Arc::clone(&self.outstanding),
                    locked: true,
                })
            }
            Err(e) => {
                self.outstanding.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn release(&self, token: LockToken) -> InstallerResult<()> {
        token.release()
    }

    fn lock_file(&self) -> InstallerResult<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                InstallerError::LockFile(format!("{}: {}", parent.display(), e))
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| InstallerError::LockFile(format!("{}: {}", self.path.display(), e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Lock already held by another process at {}", self.path.display());
                Err(InstallerError::LockBusy(self.path.display().to_string()))
            }
            Err(e) => Err(InstallerError::LockFile(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[derive(Debug)]
pub struct LockToken {
    file: File,
    path: PathBuf,
    outstanding: Arc<AtomicBool>,
    locked: bool,
}

impl LockToken {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Drops the file lock for the duration of `f` so an external tool can take
    /// its own lock, then blocks until the lock is ours again. The lock is
    /// re-taken before returning whatever `f` produced, including failures.
    ///
    /// Other processes may have mutated the database inside the window; callers
    /// must treat anything read before it as stale.
    pub async fn release_during<F, Fut, T>(&mut self, f: F) -> InstallerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        FileExt::unlock(&self.file)
            .map_err(|e| InstallerError::LockFile(format!("{}: {}", self.path.display(), e)))?;
        self.locked = false;
        debug!("Lock released for an external step: {}", self.path.display());

        let result = f().await;

        let file = self.file.try_clone()?;
        tokio::task::spawn_blocking(move || file.lock_exclusive())
            .await?
            .map_err(|e| InstallerError::LockFile(format!("{}: {}", self.path.display(), e)))?;
        self.locked = true;
        debug!("Lock re-acquired: {}", self.path.display());

        Ok(result)
    }

    pub fn release(mut self) -> InstallerResult<()> {
        self.unlock()
    }

    fn unlock(&mut self) -> InstallerResult<()> {
        if self.locked {
            self.locked = false;
            FileExt::unlock(&self.file).map_err(|e| {
                InstallerError::LockFile(format!("{}: {}", self.path.display(), e))
            })?;
        }
        if self.outstanding.swap(false, Ordering::SeqCst) {
            info!("Released package database lock at {}", self.path.display());
        }
        Ok(())
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!("Failed to release lock: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));

        let token = manager.acquire().unwrap();
        assert!(manager.is_held());
        assert!(token.is_locked());
        assert!(manager.path().exists());

        manager.release(token).unwrap();
        assert!(!manager.is_held());
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn test_second_acquire_in_process_fails() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));

        let _token = manager.acquire().unwrap();
        let err = manager.acquire().unwrap_err();
        assert!(matches!(err, InstallerError::DatabaseLock(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_foreign_holder_reports_busy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.lck");
        let ours = LockManager::new(&path);
        // a separate manager opens its own file description, like another process
        let theirs = LockManager::new(&path);

        let held = theirs.acquire().unwrap();
        let err = ours.acquire().unwrap_err();
        assert!(matches!(err, InstallerError::LockBusy(_)));
        assert!(!ours.is_held());

        drop(held);
        assert!(ours.acquire().is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("nested").join("db.lck"));
        {
            let _token = manager.acquire().unwrap();
        }
        assert!(!manager.is_held());
    }

    #[tokio::test]
    async fn test_release_during_opens_window_and_relocks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.lck");
        let manager = LockManager::new(&path);
        let outsider = LockManager::new(&path);

        let mut token = manager.acquire().unwrap();
        let seen_free = token
            .release_during(|| async {
                let attempt = outsider.acquire();
                attempt.is_ok()
            })
            .await
            .unwrap();

        assert!(seen_free);
        assert!(token.is_locked());
        assert!(matches!(
            outsider.acquire().unwrap_err(),
            InstallerError::LockBusy(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relock_waits_for_foreign_holder() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.lck");
        let manager = LockManager::new(&path);
        let outsider = LockManager::new(&path);
        let hold = Duration::from_millis(300);

        let mut token = manager.acquire().unwrap();
        let started = Instant::now();
        let holder = token
            .release_during(|| async {
                let held = outsider.acquire().unwrap();
                std::thread::spawn(move || {
                    std::thread::sleep(hold);
                    drop(held);
                })
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= hold);
        assert!(token.is_locked());
        assert!(manager.is_held());
        holder.join().unwrap();
        assert!(matches!(
            outsider.acquire().unwrap_err(),
            InstallerError::LockBusy(_)
        ));
    }

    #[tokio::test]
    async fn test_release_during_relocks_after_failure() {
        let temp = TempDir::new().unwrap();
        let manager = LockManager::new(temp.path().join("db.lck"));
        let mut token = manager.acquire().unwrap();

        let inner: InstallerResult<()> = token
            .release_during(|| async { Err(InstallerError::Sync("mirror down".into())) })
            .await
            .unwrap();

        assert!(inner.is_err());
        assert!(token.is_locked());
        assert!(manager.is_held());
    }
}
