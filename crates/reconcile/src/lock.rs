//! Lock manager - single-writer access to the state store
//!
//! Locks live next to the state file:
//!
//! - `<state>.lock` holds the exclusive (apply) lock, created atomically
//! - `<state>.lock.d/<owner>.json` holds one file per shared (plan) holder
//!
//! An exclusive acquirer creates its file first and then looks for live
//! readers; a reader writes its file first and then looks for a live
//! exclusive holder. Either way at least one side sees the other.
//!
//! Holders refresh `heartbeat_at` while they work. A lock whose heartbeat is
//! older than the staleness window is assumed abandoned and broken with a
//! warning; if the old holder was in fact still alive both may write, which
//! is why breaking is always logged.

use crate::error::{ConflictError, ReconcileError, Result, StateError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Placeholder owner for a lock file that cannot be parsed (e.g. a holder
/// crashed between creating and writing it).
const UNKNOWN_OWNER: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Persisted lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub mode: LockMode,
}

impl LockRecord {
    fn new(owner_id: &str, mode: LockMode) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            mode,
        }
    }

    /// Whether the holder has not refreshed the lock within `staleness`.
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        let window = TimeDelta::from_std(staleness).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.heartbeat_at) > window
    }

    fn same_holder(&self, other: &Self) -> bool {
        self.owner_id == other.owner_id && self.acquired_at == other.acquired_at
    }

    fn held_error(&self) -> ReconcileError {
        ConflictError::LockHeld {
            owner: self.owner_id.clone(),
            heartbeat_at: self.heartbeat_at,
        }
        .into()
    }
}

/// Current holders of a state lock.
#[derive(Debug, Clone, Default)]
pub struct LockStatus {
    pub exclusive: Option<LockRecord>,
    pub shared: Vec<LockRecord>,
}

impl LockStatus {
    pub fn is_unlocked(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Default owner identity: `user@host:pid`.
pub fn default_owner_id() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}:{}", std::process::id())
}

/// Hands out exclusive and shared locks over one state file.
#[derive(Debug, Clone)]
pub struct LockManager {
    exclusive_path: PathBuf,
    shared_dir: PathBuf,
    staleness: Duration,
}

impl LockManager {
    /// Lock files for the state file at `state_path`.
    pub fn for_state(state_path: &Path, staleness: Duration) -> Self {
        let mut name = state_path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        Self::new(state_path.with_file_name(name), staleness)
    }

    pub fn new(lock_path: impl Into<PathBuf>, staleness: Duration) -> Self {
        let exclusive_path = lock_path.into();
        let mut dir_name = exclusive_path.file_name().unwrap_or_default().to_os_string();
        dir_name.push(".d");
        let shared_dir = exclusive_path.with_file_name(dir_name);
        Self {
            exclusive_path,
            shared_dir,
            staleness,
        }
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Acquire the exclusive lock. Not reentrant: a second acquisition by
    /// the same owner fails like any other.
    pub fn acquire(&self, owner_id: &str) -> Result<LockGuard> {
        ensure_parent(&self.exclusive_path)?;
        let record = LockRecord::new(owner_id, LockMode::Exclusive);

        for attempt in 0..2 {
            match create_new(&self.exclusive_path, &record) {
                Ok(()) => {
                    if let Some(reader) = self.live_readers()?.into_iter().next() {
                        remove_if_exists(&self.exclusive_path)?;
                        return Err(reader.held_error());
                    }
                    log::debug!("Acquired exclusive state lock for {owner_id}");
                    return Ok(LockGuard::new(self.exclusive_path.clone(), record));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_record(&self.exclusive_path)?;
                    let Some(holder) = holder else {
                        // Released between our create and our read.
                        continue;
                    };
                    if attempt == 0 && holder.is_stale(Utc::now(), self.staleness) {
                        self.break_stale(&holder)?;
                        continue;
                    }
                    return Err(holder.held_error());
                }
                Err(source) => {
                    return Err(StateError::Write {
                        path: self.exclusive_path.clone(),
                        source,
                    }
                    .into());
                }
            }
        }

        match read_record(&self.exclusive_path)? {
            Some(holder) => Err(holder.held_error()),
            None => Err(ConflictError::LockLost {
                owner: owner_id.to_string(),
            }
            .into()),
        }
    }

    /// Acquire a shared lock for a plan-only run. Any number of shared
    /// holders may coexist; a live exclusive holder blocks them.
    pub fn acquire_shared(&self, owner_id: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.shared_dir).map_err(|source| StateError::Write {
            path: self.shared_dir.clone(),
            source,
        })?;

        let path = self.shared_dir.join(format!("{}.json", sanitize(owner_id)));
        let record = LockRecord::new(owner_id, LockMode::Shared);
        match create_new(&path, &record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_record(&path)?.unwrap_or(record);
                return Err(holder.held_error());
            }
            Err(source) => return Err(StateError::Write { path, source }.into()),
        }

        if let Some(holder) = read_record(&self.exclusive_path)? {
            if holder.is_stale(Utc::now(), self.staleness) {
                if let Err(e) = self.break_stale(&holder) {
                    remove_if_exists(&path)?;
                    return Err(e);
                }
            } else {
                remove_if_exists(&path)?;
                return Err(holder.held_error());
            }
        }

        log::debug!("Acquired shared state lock for {owner_id}");
        Ok(LockGuard::new(path, record))
    }

    /// Current holders. Stale records are reported, not removed.
    pub fn status(&self) -> Result<LockStatus> {
        Ok(LockStatus {
            exclusive: read_record(&self.exclusive_path)?,
            shared: self.readers()?,
        })
    }

    /// Remove the lock(s) held by `owner_id` regardless of liveness.
    ///
    /// Returns whether anything was removed.
    pub fn force_unlock(&self, owner_id: &str) -> Result<bool> {
        let mut removed = false;

        if let Some(holder) = read_record(&self.exclusive_path)?
            && holder.owner_id == owner_id
        {
            log::warn!("Force-unlocking exclusive state lock held by {owner_id}");
            remove_if_exists(&self.exclusive_path)?;
            removed = true;
        }

        let reader_path = self.shared_dir.join(format!("{}.json", sanitize(owner_id)));
        if reader_path.exists() {
            log::warn!("Force-unlocking shared state lock held by {owner_id}");
            remove_if_exists(&reader_path)?;
            removed = true;
        }

        Ok(removed)
    }

    fn readers(&self) -> Result<Vec<LockRecord>> {
        let entries = match fs::read_dir(&self.shared_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateError::Read {
                    path: self.shared_dir.clone(),
                    source,
                }
                .into());
            }
        };

        let mut readers = Vec::new();
        for entry in entries.flatten() {
            if let Some(record) = read_record(&entry.path())? {
                readers.push(record);
            }
        }
        readers.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        Ok(readers)
    }

    /// Live shared holders; stale reader files are removed with a warning.
    fn live_readers(&self) -> Result<Vec<LockRecord>> {
        let now = Utc::now();
        let mut live = Vec::new();
        for reader in self.readers()? {
            if reader.is_stale(now, self.staleness) {
                log::warn!(
                    "Breaking stale shared lock held by {} (last heartbeat {})",
                    reader.owner_id,
                    reader.heartbeat_at
                );
                remove_if_exists(&self.shared_dir.join(format!("{}.json", sanitize(&reader.owner_id))))?;
            } else {
                live.push(reader);
            }
        }
        Ok(live)
    }

    /// Move a stale exclusive lock out of the way.
    ///
    /// The file is renamed rather than deleted so that a concurrent breaker
    /// who already replaced it with a fresh lock can be detected and
    /// restored.
    fn break_stale(&self, stale: &LockRecord) -> Result<()> {
        log::warn!(
            "Breaking stale state lock held by {} (last heartbeat {}, staleness window {:?})",
            stale.owner_id,
            stale.heartbeat_at,
            self.staleness
        );

        let mut name = self.exclusive_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(
            ".broken-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let broken = self.exclusive_path.with_file_name(name);

        match fs::rename(&self.exclusive_path, &broken) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(StateError::Write {
                    path: self.exclusive_path.clone(),
                    source,
                }
                .into());
            }
        }

        match read_record(&broken)? {
            Some(moved) if !moved.same_holder(stale) && !moved.is_stale(Utc::now(), self.staleness) => {
                // Someone else broke it first and now holds a fresh lock.
                if !self.exclusive_path.exists() {
                    let _ = fs::rename(&broken, &self.exclusive_path);
                }
                Err(moved.held_error())
            }
            _ => {
                remove_if_exists(&broken)?;
                Ok(())
            }
        }
    }
}

/// A held lock. Released on drop; `release` is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: Mutex<LockRecord>,
    released: AtomicBool,
}

impl LockGuard {
    fn new(path: PathBuf, record: LockRecord) -> Self {
        Self {
            path,
            record: Mutex::new(record),
            released: AtomicBool::new(false),
        }
    }

    pub fn owner_id(&self) -> String {
        self.lock_record().owner_id.clone()
    }

    pub fn mode(&self) -> LockMode {
        self.lock_record().mode
    }

    pub fn record(&self) -> LockRecord {
        self.lock_record().clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Check that the lock file still belongs to this holder.
    pub fn verify(&self) -> Result<()> {
        let ours = self.record();
        if self.is_released() {
            return Err(ConflictError::LockLost {
                owner: ours.owner_id,
            }
            .into());
        }
        match read_record(&self.path)? {
            Some(current) if current.same_holder(&ours) => Ok(()),
            _ => Err(ConflictError::LockLost {
                owner: ours.owner_id,
            }
            .into()),
        }
    }

    /// Check that this is a live exclusive lock, as required for writes.
    pub fn ensure_exclusive(&self) -> Result<()> {
        let mode = self.mode();
        if mode != LockMode::Exclusive {
            return Err(ConflictError::LockNotExclusive {
                owner: self.owner_id(),
            }
            .into());
        }
        self.verify()
    }

    /// Refresh `heartbeat_at` so other processes do not consider the lock
    /// stale.
    pub fn heartbeat(&self) -> Result<()> {
        self.verify()?;
        let mut record = self.lock_record();
        record.heartbeat_at = Utc::now();
        write_record(&self.path, &record)?;
        log::trace!("Refreshed state lock heartbeat for {}", record.owner_id);
        Ok(())
    }

    /// Release the lock. Releasing twice is a no-op, and a lock file that
    /// was taken over by someone else is left alone.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let ours = self.record();
        match read_record(&self.path)? {
            Some(current) if current.same_holder(&ours) => {
                remove_if_exists(&self.path)?;
                log::debug!("Released state lock for {}", ours.owner_id);
            }
            _ => log::warn!(
                "State lock for {} was taken over before release",
                ours.owner_id
            ),
        }
        Ok(())
    }

    fn lock_record(&self) -> MutexGuard<'_, LockRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Failed to release state lock: {e}");
        }
    }
}

fn sanitize(owner_id: &str) -> String {
    owner_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|source| StateError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn create_new(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let content = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    file.write_all(&content)?;
    file.sync_all()
}

fn write_record(path: &Path, record: &LockRecord) -> Result<()> {
    let content = serde_json::to_vec_pretty(record).map_err(StateError::from)?;
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let tmp = path.with_file_name(name);
    let write_err = |source| -> ReconcileError {
        StateError::Write {
            path: path.to_path_buf(),
            source,
        }
        .into()
    };
    fs::write(&tmp, content).map_err(write_err)?;
    fs::rename(&tmp, path).map_err(write_err)?;
    Ok(())
}

/// Read a lock record. Missing file is `None`; an unreadable record is
/// reported as held by an unknown owner, aged by the file's mtime.
fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            }
            .into());
        }
    };

    match serde_json::from_slice(&content) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            log::debug!("Unreadable lock record {}: {e}", path.display());
            let modified = fs::metadata(path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            Ok(Some(LockRecord {
                owner_id: UNKNOWN_OWNER.to_string(),
                acquired_at: modified,
                heartbeat_at: modified,
                mode: LockMode::Exclusive,
            }))
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StateError::Write {
            path: path.to_path_buf(),
            source,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> LockManager {
        LockManager::for_state(&dir.join("state.json"), Duration::from_secs(60))
    }

    fn write_stale(path: &Path, owner: &str, mode: LockMode) {
        let old = Utc::now() - TimeDelta::hours(2);
        let record = LockRecord {
            owner_id: owner.to_string(),
            acquired_at: old,
            heartbeat_at: old,
            mode,
        };
        fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
    }

    fn is_lock_held(err: &ReconcileError, expected_owner: &str) -> bool {
        matches!(
            err,
            ReconcileError::Conflict(ConflictError::LockHeld { owner, .. }) if owner == expected_owner
        )
    }

    #[test]
    fn test_exclusive_lock_blocks_second_owner() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire("alice").unwrap();
        assert_eq!(guard.mode(), LockMode::Exclusive);
        assert!(dir.path().join("state.json.lock").exists());

        let err = locks.acquire("bob").unwrap_err();
        assert!(is_lock_held(&err, "alice"));

        guard.release().unwrap();
        let guard = locks.acquire("bob").unwrap();
        assert_eq!(guard.owner_id(), "bob");
    }

    #[test]
    fn test_not_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _guard = locks.acquire("alice").unwrap();
        let err = locks.acquire("alice").unwrap_err();
        assert!(is_lock_held(&err, "alice"));
    }

    #[test]
    fn test_release_is_idempotent_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire("alice").unwrap();
        guard.release().unwrap();
        guard.release().unwrap();
        assert!(guard.is_released());
        drop(guard);

        {
            let _guard = locks.acquire("bob").unwrap();
        }
        assert!(locks.status().unwrap().is_unlocked());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        write_stale(&dir.path().join("state.json.lock"), "crashed", LockMode::Exclusive);

        let guard = locks.acquire("alice").unwrap();
        assert_eq!(locks.status().unwrap().exclusive.unwrap().owner_id, "alice");

        drop(guard);
        assert!(locks.status().unwrap().is_unlocked());
    }

    #[test]
    fn test_live_lock_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::for_state(&dir.path().join("state.json"), Duration::from_secs(3600));
        let _guard = locks.acquire("alice").unwrap();
        assert!(locks.acquire("bob").is_err());
    }

    #[test]
    fn test_shared_locks_coexist_and_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let first = locks.acquire_shared("planner-1").unwrap();
        let second = locks.acquire_shared("planner-2").unwrap();
        assert_eq!(locks.status().unwrap().shared.len(), 2);

        let err = locks.acquire("writer").unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(ConflictError::LockHeld { .. })));
        assert!(locks.status().unwrap().exclusive.is_none());

        first.release().unwrap();
        second.release().unwrap();
        assert!(locks.acquire("writer").is_ok());
    }

    #[test]
    fn test_exclusive_blocks_shared() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let _writer = locks.acquire("writer").unwrap();
        let err = locks.acquire_shared("planner").unwrap_err();
        assert!(is_lock_held(&err, "writer"));
        assert!(locks.status().unwrap().shared.is_empty());
    }

    #[test]
    fn test_stale_reader_does_not_block_writer() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        let readers = dir.path().join("state.json.lock.d");
        fs::create_dir_all(&readers).unwrap();
        write_stale(&readers.join("old-planner.json"), "old-planner", LockMode::Shared);

        assert!(locks.acquire("writer").is_ok());
    }

    #[test]
    fn test_heartbeat_and_lost_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());

        let guard = locks.acquire("alice").unwrap();
        let before = guard.record().heartbeat_at;
        std::thread::sleep(Duration::from_millis(5));
        guard.heartbeat().unwrap();
        assert!(guard.record().heartbeat_at > before);
        assert!(guard.ensure_exclusive().is_ok());

        assert!(locks.force_unlock("alice").unwrap());
        let err = guard.heartbeat().unwrap_err();
        assert!(matches!(err, ReconcileError::Conflict(ConflictError::LockLost { .. })));
    }

    #[test]
    fn test_shared_lock_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        let guard = locks.acquire_shared("planner").unwrap();
        assert!(matches!(
            guard.ensure_exclusive(),
            Err(ReconcileError::Conflict(ConflictError::LockNotExclusive { .. }))
        ));
    }

    #[test]
    fn test_unreadable_lock_file_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let locks = manager(dir.path());
        fs::write(dir.path().join("state.json.lock"), b"").unwrap();

        let err = locks.acquire("alice").unwrap_err();
        assert!(is_lock_held(&err, UNKNOWN_OWNER));
    }
}
