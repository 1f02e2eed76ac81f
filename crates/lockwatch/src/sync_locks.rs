// ── Blocking read/write lock ────────────────────────────

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::config::{self, StallHandler};
use crate::monitor::{self, Watch};
use crate::registry::{AcquireKind, CallSite, LastLocker, LockCore, LockInfo};
use crate::{LockError, TaskId};

/// A `parking_lot::RwLock` that refuses re-entrant acquisition by the same
/// task and reports acquisitions that stay blocked past a timeout.
///
/// `read` and `write` panic on a re-entrancy violation. The `*_checked` and
/// `*_as` forms return it as [`LockError`] instead.
pub struct RwMutex<T> {
    core: Arc<LockCore>,
    inner: RwLock<T>,
}

impl<T> RwMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(None)),
            inner: RwLock::new(value),
        }
    }

    /// Like [`RwMutex::new`], with a name that shows up in errors, logs and
    /// stall reports.
    pub fn with_name(name: &'static str, value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(Some(name))),
            inner: RwLock::new(value),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.core.name
    }

    // ── shared ──────────────────────────────────────────

    #[track_caller]
    pub fn read(&self) -> RwMutexReadGuard<'_, T> {
        match self.read_at(TaskId::current(), CallSite::caller()) {
            Ok(guard) => guard,
            Err(err) => panic!("{err}"),
        }
    }

    #[track_caller]
    pub fn read_checked(&self) -> Result<RwMutexReadGuard<'_, T>, LockError> {
        self.read_at(TaskId::current(), CallSite::caller())
    }

    /// Acquires a read lock on behalf of an explicit task identity.
    #[track_caller]
    pub fn read_as(&self, task: TaskId) -> Result<RwMutexReadGuard<'_, T>, LockError> {
        self.read_at(task, CallSite::caller())
    }

    /// Never blocks and never enters the watch set. `Ok(None)` means a
    /// writer holds (or is queued for) the lock.
    #[track_caller]
    pub fn try_read(&self) -> Result<Option<RwMutexReadGuard<'_, T>>, LockError> {
        let task = TaskId::current();
        let call_site = CallSite::caller();
        self.core.check_read(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Read, call_site);
        let guard = if self.core.registry.has_read(task) {
            self.inner.try_read_recursive()
        } else {
            self.inner.try_read()
        };
        Ok(guard.map(|guard| self.grant_read(guard, info)))
    }

    fn read_at(
        &self,
        task: TaskId,
        call_site: CallSite,
    ) -> Result<RwMutexReadGuard<'_, T>, LockError> {
        self.core.check_read(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Read, call_site);
        // A task that already reads must not queue behind a waiting writer.
        let guard = if self.core.registry.has_read(task) {
            acquire(
                &self.core,
                &info,
                || self.inner.try_read_recursive(),
                || self.inner.read_recursive(),
            )
        } else {
            acquire(
                &self.core,
                &info,
                || self.inner.try_read(),
                || self.inner.read(),
            )
        };
        Ok(self.grant_read(guard, info))
    }

    fn grant_read<'a>(
        &'a self,
        guard: RwLockReadGuard<'a, T>,
        info: LockInfo,
    ) -> RwMutexReadGuard<'a, T> {
        let (task, holder_id) = (info.task, info.holder_id);
        self.core.registry.record_read(info);
        RwMutexReadGuard {
            guard: ManuallyDrop::new(guard),
            core: &self.core,
            task,
            holder_id,
        }
    }

    // ── exclusive ───────────────────────────────────────

    #[track_caller]
    pub fn write(&self) -> RwMutexWriteGuard<'_, T> {
        match self.write_at(TaskId::current(), CallSite::caller()) {
            Ok(guard) => guard,
            Err(err) => panic!("{err}"),
        }
    }

    #[track_caller]
    pub fn write_checked(&self) -> Result<RwMutexWriteGuard<'_, T>, LockError> {
        self.write_at(TaskId::current(), CallSite::caller())
    }

    /// Acquires the write lock on behalf of an explicit task identity.
    #[track_caller]
    pub fn write_as(&self, task: TaskId) -> Result<RwMutexWriteGuard<'_, T>, LockError> {
        self.write_at(task, CallSite::caller())
    }

    #[track_caller]
    pub fn try_write(&self) -> Result<Option<RwMutexWriteGuard<'_, T>>, LockError> {
        let task = TaskId::current();
        let call_site = CallSite::caller();
        self.core.check_write(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Write, call_site);
        Ok(self
            .inner
            .try_write()
            .map(|guard| self.grant_write(guard, info)))
    }

    fn write_at(
        &self,
        task: TaskId,
        call_site: CallSite,
    ) -> Result<RwMutexWriteGuard<'_, T>, LockError> {
        self.core.check_write(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Write, call_site);
        let guard = acquire(
            &self.core,
            &info,
            || self.inner.try_write(),
            || self.inner.write(),
        );
        Ok(self.grant_write(guard, info))
    }

    fn grant_write<'a>(
        &'a self,
        guard: RwLockWriteGuard<'a, T>,
        info: LockInfo,
    ) -> RwMutexWriteGuard<'a, T> {
        let (task, holder_id) = (info.task, info.holder_id);
        self.core.registry.record_write(info);
        RwMutexWriteGuard {
            guard: ManuallyDrop::new(guard),
            core: &self.core,
            task,
            holder_id,
        }
    }

    // ── configuration & diagnostics ─────────────────────

    /// Overrides the global stall timeout for this lock. A zero `timeout`
    /// removes the override; a `None` handler falls back to the global one.
    pub fn set_lock_timeout(&self, timeout: Duration, handler: Option<StallHandler>) {
        self.core.set_policy(timeout, handler);
        monitor::wake();
    }

    /// This lock's own override, zero when unset.
    pub fn lock_timeout(&self) -> Duration {
        self.core.lock_timeout()
    }

    /// The timeout the monitor applies to this lock right now, zero when
    /// detection is disabled for it.
    pub fn effective_lock_timeout(&self) -> Duration {
        let policy = self.core.effective_policy(&config::global_policy());
        if policy.is_enabled() {
            policy.timeout
        } else {
            Duration::ZERO
        }
    }

    /// Some current holder of the lock, readers first.
    pub fn last_locker(&self) -> Option<LastLocker> {
        self.core.registry.last_locker()
    }

    /// `(writers, distinct reading tasks)`.
    pub fn holder_counts(&self) -> (usize, usize) {
        self.core.registry.holder_counts()
    }

    /// Number of acquisitions of this lock currently blocked and watched.
    pub fn pending_acquisitions(&self) -> usize {
        monitor::pending_for(&self.core)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for RwMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for RwMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (writers, readers) = self.holder_counts();
        let (acquires, releases) = self.core.registry.totals();
        f.debug_struct("RwMutex")
            .field("name", &self.core.name)
            .field("writers", &writers)
            .field("readers", &readers)
            .field("acquires", &acquires)
            .field("releases", &releases)
            .finish_non_exhaustive()
    }
}

/// Tries the uncontended path first; only an attempt that would block is
/// published to the monitor.
fn acquire<G>(
    core: &Arc<LockCore>,
    info: &LockInfo,
    try_now: impl FnOnce() -> Option<G>,
    block: impl FnOnce() -> G,
) -> G {
    if let Some(guard) = try_now() {
        return guard;
    }
    trace!(
        target: "lockwatch",
        lock = core.name.unwrap_or("<unnamed>"),
        task = %info.task,
        kind = %info.kind,
        "lock contended"
    );
    let _watch = Watch::register(core, info);
    block()
}

// ── Guards ──────────────────────────────────────────────

pub struct RwMutexReadGuard<'a, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    core: &'a LockCore,
    task: TaskId,
    holder_id: u64,
}

impl<T> Drop for RwMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `guard` is never touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.core.registry.clear_read(self.task, self.holder_id);
    }
}

impl<T> Deref for RwMutexReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct RwMutexWriteGuard<'a, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    core: &'a LockCore,
    task: TaskId,
    holder_id: u64,
}

impl<T> Drop for RwMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `guard` is never touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.core.registry.clear_write(self.task, self.holder_id);
    }
}

impl<T> Deref for RwMutexWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RwMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
