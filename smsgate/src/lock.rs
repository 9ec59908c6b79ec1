//! Single-instance lock for the worker.
//!
//! The lock is a file created exclusively and holding the owner's PID. A lock
//! whose modification time is older than the grace period is treated as left
//! behind by a dead worker and taken over. Owners that live longer than the
//! grace period keep the lock current with [`LockGuard::keep_fresh`], which
//! touches the file from a background task whether or not cycles run.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use smsgate_common::internal;
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Lock file {path} was removed or taken over by another worker")]
    Lost { path: PathBuf },
}

impl LockError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct LockFile;

impl LockFile {
    /// Try to become the single running worker.
    ///
    /// Returns `Ok(None)` when another live owner holds the lock.
    ///
    /// # Errors
    /// Returns [`LockError::Io`] if the lock file cannot be created, read or
    /// removed for a reason other than contention.
    pub fn acquire(path: impl AsRef<Path>, grace: Duration) -> Result<Option<LockGuard>, LockError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let pid = std::process::id();
                    writeln!(file, "{pid}").map_err(|e| LockError::io(path, e))?;
                    internal!(level = DEBUG, path = %path.display(), pid, "Lock acquired");
                    return Ok(Some(LockGuard {
                        path: path.to_path_buf(),
                        pid,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if attempt > 0 || !Self::is_abandoned(path, grace)? {
                        return Ok(None);
                    }
                    internal!(
                        level = WARN,
                        path = %path.display(),
                        holder = Self::holder(path).as_deref().unwrap_or("unknown"),
                        "Taking over abandoned lock"
                    );
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(LockError::io(path, e)),
                    }
                }
                Err(e) => return Err(LockError::io(path, e)),
            }
        }

        Ok(None)
    }

    fn is_abandoned(path: &Path, grace: Duration) -> Result<bool, LockError> {
        match fs::metadata(path).and_then(|m| m.modified()) {
            // Released between our create attempt and now.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(LockError::io(path, e)),
            Ok(modified) => Ok(modified.elapsed().is_ok_and(|age| age > grace)),
        }
    }

    fn holder(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|pid| pid.trim().to_string())
            .filter(|pid| !pid.is_empty())
    }
}

/// Proof of ownership; the lock file is removed when this is dropped, unless
/// another worker has taken it over in the meantime.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bump the lock's modification time after checking it is still ours.
    ///
    /// # Errors
    /// Returns [`LockError::Lost`] if the lock file is gone or names another
    /// process, and [`LockError::Io`] if it cannot be read or touched.
    pub fn refresh(&self) -> Result<(), LockError> {
        touch(&self.path, self.pid)
    }

    /// Refresh the lock every `every` on a background task until the returned
    /// handle is dropped.
    #[must_use]
    pub fn keep_fresh(&self, every: Duration) -> LockRefresher {
        let path = self.path.clone();
        let pid = self.pid;
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once and the lock was just written.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match touch(&path, pid) {
                    Ok(()) => {}
                    Err(e @ LockError::Lost { .. }) => {
                        internal!(level = ERROR, error = %e, "Worker lock lost");
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => internal!(level = WARN, error = %e, "Failed to refresh lock"),
                }
            }
        });

        LockRefresher { task, lost }
    }
}

fn touch(path: &Path, pid: u32) -> Result<(), LockError> {
    match fs::read_to_string(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(LockError::Lost {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(LockError::io(path, e)),
        Ok(holder) if holder.trim() != pid.to_string() => {
            return Err(LockError::Lost {
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
    }

    OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_modified(SystemTime::now()))
        .map_err(|e| LockError::io(path, e))
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let path = self.path.display();
        match fs::read_to_string(&self.path) {
            Ok(holder) if holder.trim() == self.pid.to_string() => {}
            Ok(holder) => {
                internal!(
                    level = WARN,
                    path = %path,
                    holder = holder.trim(),
                    "Lock taken over by another worker, leaving it in place"
                );
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                internal!(level = WARN, path = %path, "Lock file already removed");
                return;
            }
            Err(e) => {
                internal!(level = WARN, path = %path, error = %e, "Failed to read lock before release");
                return;
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => internal!(level = DEBUG, path = %path, "Lock released"),
            Err(e) => internal!(
                level = WARN,
                path = %path,
                error = %e,
                "Failed to release lock"
            ),
        }
    }
}

/// Background refresh of a [`LockGuard`]; stops when dropped.
#[derive(Debug)]
pub struct LockRefresher {
    task: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LockRefresher {
    /// Whether a refresh found the lock gone or owned by someone else.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for LockRefresher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;

    const GRACE: Duration = Duration::from_secs(600);

    fn age(path: &Path, by: Duration) {
        File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_modified(SystemTime::now() - by))
            .expect("set mtime");
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");

        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("free lock");
        assert!(LockFile::acquire(&path, GRACE).expect("acquire").is_none());

        let pid = fs::read_to_string(&path).expect("read lock");
        assert_eq!(pid.trim(), std::process::id().to_string());

        drop(guard);
        assert!(!path.exists());
        assert!(LockFile::acquire(&path, GRACE).expect("acquire").is_some());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        fs::write(&path, "99999\n").expect("write stale lock");
        age(&path, GRACE + Duration::from_secs(60));

        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("stale lock reclaimed");
        assert_eq!(guard.path(), path);
    }

    #[test]
    fn young_foreign_lock_is_respected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        fs::write(&path, "99999\n").expect("write lock");
        age(&path, Duration::from_secs(60));

        assert!(LockFile::acquire(&path, GRACE).expect("acquire").is_none());
        assert!(path.exists());
    }

    #[test]
    fn refresh_keeps_a_long_lived_owner_current() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("free lock");

        age(&path, GRACE + Duration::from_secs(60));
        guard.refresh().expect("refresh");

        assert!(LockFile::acquire(&path, GRACE).expect("acquire").is_none());
    }

    #[test]
    fn refresh_fails_once_the_lock_is_gone_or_taken() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("free lock");

        fs::write(&path, "99999\n").expect("overwrite lock");
        assert!(matches!(guard.refresh(), Err(LockError::Lost { .. })));

        fs::remove_file(&path).expect("remove lock");
        assert!(matches!(guard.refresh(), Err(LockError::Lost { .. })));
    }

    #[test]
    fn release_leaves_a_lock_taken_over_by_another_worker() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("free lock");

        fs::write(&path, "99999\n").expect("overwrite lock");
        drop(guard);

        assert_eq!(fs::read_to_string(&path).expect("read lock"), "99999\n");
    }

    #[tokio::test]
    async fn background_refresh_outlives_the_grace_period() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        let grace = Duration::from_secs(1);
        let guard = LockFile::acquire(&path, grace)
            .expect("acquire")
            .expect("free lock");
        let refresher = guard.keep_fresh(grace / 4);

        tokio::time::sleep(grace * 2 + grace / 2).await;

        assert!(LockFile::acquire(&path, grace).expect("acquire").is_none());
        assert!(!refresher.is_lost());
    }

    #[tokio::test]
    async fn background_refresh_notices_a_stolen_lock() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("worker.lock");
        let guard = LockFile::acquire(&path, GRACE)
            .expect("acquire")
            .expect("free lock");
        let refresher = guard.keep_fresh(Duration::from_millis(20));

        fs::write(&path, "99999\n").expect("overwrite lock");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !refresher.is_lost() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("loss noticed");
    }

    #[test]
    fn missing_parent_directories_are_created() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run/smsgate/worker.lock");
        assert!(LockFile::acquire(&path, GRACE).expect("acquire").is_some());
    }
}
