// ── Per-lock ownership registry ─────────────────────────

use std::collections::HashMap;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::error;

use crate::config::{self, StallHandler, TimeoutPolicy};
use crate::{LockError, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireKind {
    Read,
    Write,
}

impl fmt::Display for AcquireKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireKind::Read => write!(f, "read"),
            AcquireKind::Write => write!(f, "write"),
        }
    }
}

/// Source location of a lock acquisition, captured with `#[track_caller]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite(&'static Location<'static>);

impl CallSite {
    #[track_caller]
    pub fn caller() -> Self {
        Self(Location::caller())
    }

    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    pub fn line(&self) -> u32 {
        self.0.line()
    }

    pub fn column(&self) -> u32 {
        self.0.column()
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file(), self.line(), self.column())
    }
}

/// One acquisition attempt on one lock by one task.
#[derive(Debug, Clone)]
pub(crate) struct LockInfo {
    pub(crate) holder_id: u64,
    pub(crate) task: TaskId,
    pub(crate) kind: AcquireKind,
    pub(crate) call_site: CallSite,
    pub(crate) since: Instant,
}

#[derive(Debug, Clone)]
struct Holder {
    info: LockInfo,
    granted_at: Instant,
}

impl Holder {
    fn locker(&self) -> LastLocker {
        LastLocker {
            task: self.info.task,
            call_site: self.info.call_site,
            held_for: self.granted_at.elapsed(),
        }
    }
}

/// Best-effort description of a current holder, see [`crate::RwMutex::last_locker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastLocker {
    pub task: TaskId,
    pub call_site: CallSite,
    pub held_for: Duration,
}

pub(crate) struct Registry {
    next_id: AtomicU64,
    writer: Mutex<Option<Holder>>,
    readers: Mutex<HashMap<TaskId, Vec<Holder>>>,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            writer: Mutex::new(None),
            readers: Mutex::new(HashMap::new()),
            total_acquires: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
        }
    }

    pub(crate) fn begin(&self, task: TaskId, kind: AcquireKind, call_site: CallSite) -> LockInfo {
        LockInfo {
            holder_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            task,
            kind,
            call_site,
            since: Instant::now(),
        }
    }

    pub(crate) fn record_write(&self, info: LockInfo) {
        *self.writer.lock() = Some(Holder {
            info,
            granted_at: Instant::now(),
        });
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_write(&self, task: TaskId, holder_id: u64) -> bool {
        let mut writer = self.writer.lock();
        let owned = writer
            .as_ref()
            .is_some_and(|h| h.info.task == task && h.info.holder_id == holder_id);
        if owned {
            *writer = None;
            self.total_releases.fetch_add(1, Ordering::Relaxed);
        }
        owned
    }

    pub(crate) fn record_read(&self, info: LockInfo) {
        self.readers.lock().entry(info.task).or_default().push(Holder {
            info,
            granted_at: Instant::now(),
        });
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear_read(&self, task: TaskId, holder_id: u64) -> bool {
        let mut readers = self.readers.lock();
        let Some(holds) = readers.get_mut(&task) else {
            return false;
        };
        let before = holds.len();
        holds.retain(|h| h.info.holder_id != holder_id);
        let removed = holds.len() != before;
        if holds.is_empty() {
            readers.remove(&task);
        }
        if removed {
            self.total_releases.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub(crate) fn write_held_by(&self, task: TaskId) -> Option<CallSite> {
        self.writer
            .lock()
            .as_ref()
            .filter(|h| h.info.task == task)
            .map(|h| h.info.call_site)
    }

    pub(crate) fn read_held_by(&self, task: TaskId) -> Option<CallSite> {
        self.readers
            .lock()
            .get(&task)
            .and_then(|holds| holds.first())
            .map(|h| h.info.call_site)
    }

    pub(crate) fn has_write(&self, task: TaskId) -> bool {
        self.write_held_by(task).is_some()
    }

    pub(crate) fn has_read(&self, task: TaskId) -> bool {
        self.read_held_by(task).is_some()
    }

    /// Read holders take precedence over the writer.
    pub(crate) fn last_locker(&self) -> Option<LastLocker> {
        let from_readers = self
            .readers
            .lock()
            .values()
            .find_map(|holds| holds.last().map(Holder::locker));
        from_readers.or_else(|| self.writer.lock().as_ref().map(Holder::locker))
    }

    /// `(writers, distinct reading tasks)`
    pub(crate) fn holder_counts(&self) -> (usize, usize) {
        let writers = usize::from(self.writer.lock().is_some());
        (writers, self.readers.lock().len())
    }

    pub(crate) fn totals(&self) -> (u64, u64) {
        (
            self.total_acquires.load(Ordering::Relaxed),
            self.total_releases.load(Ordering::Relaxed),
        )
    }
}

// ── Shared per-lock state ───────────────────────────────

/// State shared between a lock, its guards, and the stall monitor.
pub(crate) struct LockCore {
    pub(crate) name: Option<&'static str>,
    pub(crate) registry: Registry,
    policy: Mutex<TimeoutPolicy>,
}

impl LockCore {
    pub(crate) fn new(name: Option<&'static str>) -> Self {
        Self {
            name,
            registry: Registry::new(),
            policy: Mutex::new(TimeoutPolicy::disabled()),
        }
    }

    pub(crate) fn set_policy(&self, timeout: Duration, handler: Option<StallHandler>) {
        *self.policy.lock() = TimeoutPolicy { timeout, handler };
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.policy.lock().timeout
    }

    pub(crate) fn effective_policy(&self, global: &TimeoutPolicy) -> TimeoutPolicy {
        config::resolve(&self.policy.lock(), global)
    }

    pub(crate) fn check_write(&self, task: TaskId, attempted_at: CallSite) -> Result<(), LockError> {
        if let Some(held_at) = self.registry.write_held_by(task) {
            return Err(self.violation(LockError::DoubleLock {
                lock: self.name,
                task,
                held_at,
                attempted_at,
            }));
        }
        if let Some(held_at) = self.registry.read_held_by(task) {
            return Err(self.violation(LockError::LockAfterReadLock {
                lock: self.name,
                task,
                held_at,
                attempted_at,
            }));
        }
        Ok(())
    }

    pub(crate) fn check_read(&self, task: TaskId, attempted_at: CallSite) -> Result<(), LockError> {
        match self.registry.write_held_by(task) {
            Some(held_at) => Err(self.violation(LockError::DoubleLock {
                lock: self.name,
                task,
                held_at,
                attempted_at,
            })),
            None => Ok(()),
        }
    }

    fn violation(&self, err: LockError) -> LockError {
        error!(target: "lockwatch", lock = self.name.unwrap_or("<unnamed>"), "{err}");
        err
    }
}
