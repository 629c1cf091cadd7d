//! Exclusive per-job lock.
//!
//! The lock is a `job.lock` file created atomically with `create_new`. It
//! holds the owner's pid and acquisition time. While the guard is alive
//! inside a Tokio runtime, a heartbeat task refreshes the file's mtime, so
//! only a lock whose holder stopped refreshing it (a crashed process) ever
//! ages past the stale timeout and gets reclaimed. A lock held by a live
//! guard of this process is never reclaimed.
//!
//! The guard removes the file on drop, but only while the file still names
//! this guard as its holder, so a lock that was reclaimed by another process
//! is left alone.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::error::{classify, PipelineError};

pub const LOCK_FILE: &str = "job.lock";

/// Never refresh more often than this
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Lock files held by guards of this process
static HELD: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// RAII guard for a held job lock
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
    info: LockInfo,

    /// Stops the heartbeat task when the guard goes away
    _heartbeat: Option<DropGuard>,
}

impl JobLock {
    /// Acquire the lock in `job_dir` or fail with a retryable `JobLocked` error
    pub fn acquire(job_dir: &Path, job_id: &str, stale_after: Duration) -> Result<Self, PipelineError> {
        let path = job_dir.join(LOCK_FILE);

        match try_create(&path, stale_after) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(lock_io_error(e, &path)),
        }

        if !is_stale(&path, stale_after) {
            return Err(PipelineError::job_locked(job_id));
        }

        warn!(
            job_id,
            path = %path.display(),
            holder = ?read_holder(&path),
            "Reclaiming stale job lock"
        );
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(lock_io_error(e, &path)),
        }

        match try_create(&path, stale_after) {
            Ok(lock) => Ok(lock),
            // Another process reclaimed it first
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(PipelineError::job_locked(job_id)),
            Err(e) => Err(lock_io_error(e, &path)),
        }
    }

    /// Current holder, if the job is locked
    pub fn holder(job_dir: &Path) -> Option<LockInfo> {
        read_holder(&job_dir.join(LOCK_FILE))
    }

    /// Whether a lock file exists (held or stale)
    pub fn is_locked(job_dir: &Path) -> bool {
        job_dir.join(LOCK_FILE).exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Holder record written by this guard
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        release_here(&self.path);

        match read_holder(&self.path) {
            Some(holder) if holder == self.info => match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Released job lock"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to release job lock"),
            },
            Some(holder) => warn!(
                path = %self.path.display(),
                pid = holder.pid,
                "Job lock was taken over by another holder, leaving it in place"
            ),
            // Already gone, e.g. the job directory was force-deleted
            None => debug!(path = %self.path.display(), "Job lock already removed"),
        }
    }
}

fn try_create(path: &Path, stale_after: Duration) -> std::io::Result<JobLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;

    let info = LockInfo {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let json = serde_json::to_string(&info)?;
    if let Err(e) = file.write_all(json.as_bytes()).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }

    hold_here(path);
    Ok(JobLock {
        path: path.to_path_buf(),
        _heartbeat: spawn_heartbeat(path.to_path_buf(), info.clone(), stale_after),
        info,
    })
}

fn read_holder(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    if held_here(path) {
        return false;
    }

    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        // Vanished between the failed create and now
        Err(_) => return true,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

/// Refresh interval keeping a live lock well inside the stale timeout
fn heartbeat_interval(stale_after: Duration) -> Duration {
    (stale_after / 3).max(MIN_HEARTBEAT)
}

/// Touch the lock file while it still names `info`; `Ok(false)` once it does not
fn refresh(path: &Path, info: &LockInfo) -> std::io::Result<bool> {
    match read_holder(path) {
        Some(holder) if holder == *info => {
            filetime::set_file_mtime(path, FileTime::now())?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Keep the lock fresh until the returned guard is dropped.
///
/// Outside a Tokio runtime there is nothing to drive the task; such locks
/// rely on being short-lived.
fn spawn_heartbeat(path: PathBuf, info: LockInfo, stale_after: Duration) -> Option<DropGuard> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let stop = CancellationToken::new();
    let stopped = stop.clone();
    let every = heartbeat_interval(stale_after);

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let (path, info) = (path.clone(), info.clone());
            let path_str = path.display().to_string();
            match tokio::task::spawn_blocking(move || refresh(&path, &info)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    warn!(path = %path_str, "Job lock no longer ours, stopping heartbeat");
                    break;
                }
                Ok(Err(e)) => warn!(path = %path_str, error = %e, "Failed to refresh job lock"),
                Err(e) => {
                    warn!(path = %path_str, error = %e, "Lock heartbeat task failed");
                    break;
                }
            }
        }
    });

    Some(stop.drop_guard())
}

fn hold_here(path: &Path) {
    if let Ok(mut held) = HELD.lock() {
        held.insert(path.to_path_buf());
    }
}

fn release_here(path: &Path) {
    if let Ok(mut held) = HELD.lock() {
        held.remove(path);
    }
}

fn held_here(path: &Path) -> bool {
    HELD.lock().map(|held| held.contains(path)).unwrap_or(false)
}

fn lock_io_error(e: std::io::Error, path: &Path) -> PipelineError {
    classify(anyhow::Error::new(e).context(format!("Failed to create lock file {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn backdate(path: &Path, by: Duration) {
        let then = FileTime::from_system_time(SystemTime::now() - by);
        filetime::set_file_mtime(path, then).unwrap();
    }

    fn age(path: &Path) -> Duration {
        let modified = fs::metadata(path).unwrap().modified().unwrap();
        SystemTime::now().duration_since(modified).unwrap_or_default()
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp = TempDir::new().unwrap();
        let lock = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap();

        let err = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap_err();
        assert_eq!(err.category, ErrorCategory::State);
        assert!(err.retryable);

        let holder = JobLock::holder(temp.path()).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(&holder, lock.info());
        drop(lock);
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp = TempDir::new().unwrap();
        {
            let _lock = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap();
            assert!(JobLock::is_locked(temp.path()));
        }
        assert!(!JobLock::is_locked(temp.path()));
        assert!(JobLock::acquire(temp.path(), "job-1", HOUR).is_ok());
    }

    #[test]
    fn test_panic_releases_lock() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let _lock = JobLock::acquire(&dir, "job-1", HOUR).unwrap();
            panic!("step blew up");
        });

        assert!(result.is_err());
        assert!(!JobLock::is_locked(temp.path()));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join(LOCK_FILE);
        fs::write(&lock_path, r#"{"pid":1,"acquired_at":"2020-01-01T00:00:00Z"}"#).unwrap();
        backdate(&lock_path, 2 * HOUR);

        let lock = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap();
        assert_eq!(JobLock::holder(temp.path()).unwrap().pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn test_old_lock_of_live_holder_is_not_reclaimed() {
        let temp = TempDir::new().unwrap();
        let first = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap();
        backdate(first.path(), 2 * HOUR);

        let err = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap_err();
        assert_eq!(err.category, ErrorCategory::State);
        assert!(err.message.contains("locked"));
        assert_eq!(JobLock::holder(temp.path()).as_ref(), Some(first.info()));
    }

    #[test]
    fn test_drop_leaves_a_taken_over_lock_alone() {
        let temp = TempDir::new().unwrap();
        let first = JobLock::acquire(temp.path(), "job-1", HOUR).unwrap();

        // Another process reclaimed the file and now owns it
        let other = r#"{"pid":4242,"acquired_at":"2030-01-01T00:00:00Z"}"#;
        fs::write(first.path(), other).unwrap();
        drop(first);

        assert!(JobLock::is_locked(temp.path()));
        assert_eq!(JobLock::holder(temp.path()).unwrap().pid, 4242);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_fresh() {
        let temp = TempDir::new().unwrap();
        let stale_after = Duration::from_millis(300);
        let lock = JobLock::acquire(temp.path(), "job-1", stale_after).unwrap();

        backdate(lock.path(), HOUR);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(age(lock.path()) < Duration::from_secs(60));
        drop(lock);
        assert!(!JobLock::is_locked(temp.path()));
    }

    #[test]
    fn test_heartbeat_interval_stays_inside_timeout() {
        assert_eq!(heartbeat_interval(HOUR), Duration::from_secs(1200));
        assert_eq!(heartbeat_interval(Duration::from_millis(30)), MIN_HEARTBEAT);
    }
}
