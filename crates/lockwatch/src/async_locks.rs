// ── Async read/write lock ───────────────────────────────

use std::fmt;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::config::{self, StallHandler};
use crate::monitor::{self, Watch};
use crate::registry::{AcquireKind, CallSite, LastLocker, LockCore, LockInfo};
use crate::{LockError, TaskId};

/// The async counterpart of [`crate::RwMutex`], built on
/// `tokio::sync::RwLock`.
///
/// Identity is the current tokio task. The acquisition methods capture the
/// task and call site when called, so call them from the task that will own
/// the guard. Dropping a pending acquisition future withdraws it from the
/// stall monitor.
///
/// tokio's lock is fair: a task that re-enters `read` while a writer is
/// queued will wait behind that writer. The monitor reports such waits like
/// any other stall.
pub struct AsyncRwMutex<T> {
    core: Arc<LockCore>,
    inner: RwLock<T>,
}

impl<T> AsyncRwMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(None)),
            inner: RwLock::new(value),
        }
    }

    pub fn with_name(name: &'static str, value: T) -> Self {
        Self {
            core: Arc::new(LockCore::new(Some(name))),
            inner: RwLock::new(value),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.core.name
    }

    #[track_caller]
    pub fn read(&self) -> impl Future<Output = AsyncRwMutexReadGuard<'_, T>> + '_ {
        let fut = self.read_at(TaskId::current(), CallSite::caller());
        async move {
            match fut.await {
                Ok(guard) => guard,
                Err(err) => panic!("{err}"),
            }
        }
    }

    #[track_caller]
    pub fn read_checked(
        &self,
    ) -> impl Future<Output = Result<AsyncRwMutexReadGuard<'_, T>, LockError>> + '_ {
        self.read_at(TaskId::current(), CallSite::caller())
    }

    #[track_caller]
    pub fn read_as(
        &self,
        task: TaskId,
    ) -> impl Future<Output = Result<AsyncRwMutexReadGuard<'_, T>, LockError>> + '_ {
        self.read_at(task, CallSite::caller())
    }

    #[track_caller]
    pub fn try_read(&self) -> Result<Option<AsyncRwMutexReadGuard<'_, T>>, LockError> {
        let task = TaskId::current();
        let call_site = CallSite::caller();
        self.core.check_read(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Read, call_site);
        Ok(self
            .inner
            .try_read()
            .ok()
            .map(|guard| self.grant_read(guard, info)))
    }

    async fn read_at(
        &self,
        task: TaskId,
        call_site: CallSite,
    ) -> Result<AsyncRwMutexReadGuard<'_, T>, LockError> {
        self.core.check_read(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Read, call_site);
        let guard = match self.inner.try_read() {
            Ok(guard) => guard,
            Err(_) => {
                let _watch = contended(&self.core, &info);
                self.inner.read().await
            }
        };
        Ok(self.grant_read(guard, info))
    }

    fn grant_read<'a>(
        &'a self,
        guard: RwLockReadGuard<'a, T>,
        info: LockInfo,
    ) -> AsyncRwMutexReadGuard<'a, T> {
        let (task, holder_id) = (info.task, info.holder_id);
        self.core.registry.record_read(info);
        AsyncRwMutexReadGuard {
            guard: ManuallyDrop::new(guard),
            core: &self.core,
            task,
            holder_id,
        }
    }

    #[track_caller]
    pub fn write(&self) -> impl Future<Output = AsyncRwMutexWriteGuard<'_, T>> + '_ {
        let fut = self.write_at(TaskId::current(), CallSite::caller());
        async move {
            match fut.await {
                Ok(guard) => guard,
                Err(err) => panic!("{err}"),
            }
        }
    }

    #[track_caller]
    pub fn write_checked(
        &self,
    ) -> impl Future<Output = Result<AsyncRwMutexWriteGuard<'_, T>, LockError>> + '_ {
        self.write_at(TaskId::current(), CallSite::caller())
    }

    #[track_caller]
    pub fn write_as(
        &self,
        task: TaskId,
    ) -> impl Future<Output = Result<AsyncRwMutexWriteGuard<'_, T>, LockError>> + '_ {
        self.write_at(task, CallSite::caller())
    }

    #[track_caller]
    pub fn try_write(&self) -> Result<Option<AsyncRwMutexWriteGuard<'_, T>>, LockError> {
        let task = TaskId::current();
        let call_site = CallSite::caller();
        self.core.check_write(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Write, call_site);
        Ok(self
            .inner
            .try_write()
            .ok()
            .map(|guard| self.grant_write(guard, info)))
    }

    async fn write_at(
        &self,
        task: TaskId,
        call_site: CallSite,
    ) -> Result<AsyncRwMutexWriteGuard<'_, T>, LockError> {
        self.core.check_write(task, call_site)?;

        let info = self.core.registry.begin(task, AcquireKind::Write, call_site);
        let guard = match self.inner.try_write() {
            Ok(guard) => guard,
            Err(_) => {
                let _watch = contended(&self.core, &info);
                self.inner.write().await
            }
        };
        Ok(self.grant_write(guard, info))
    }

    fn grant_write<'a>(
        &'a self,
        guard: RwLockWriteGuard<'a, T>,
        info: LockInfo,
    ) -> AsyncRwMutexWriteGuard<'a, T> {
        let (task, holder_id) = (info.task, info.holder_id);
        self.core.registry.record_write(info);
        AsyncRwMutexWriteGuard {
            guard: ManuallyDrop::new(guard),
            core: &self.core,
            task,
            holder_id,
        }
    }

    pub fn set_lock_timeout(&self, timeout: Duration, handler: Option<StallHandler>) {
        self.core.set_policy(timeout, handler);
        monitor::wake();
    }

    pub fn lock_timeout(&self) -> Duration {
        self.core.lock_timeout()
    }

    pub fn effective_lock_timeout(&self) -> Duration {
        let policy = self.core.effective_policy(&config::global_policy());
        if policy.is_enabled() {
            policy.timeout
        } else {
            Duration::ZERO
        }
    }

    pub fn last_locker(&self) -> Option<LastLocker> {
        self.core.registry.last_locker()
    }

    pub fn holder_counts(&self) -> (usize, usize) {
        self.core.registry.holder_counts()
    }

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

impl<T: Default> Default for AsyncRwMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for AsyncRwMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (writers, readers) = self.holder_counts();
        f.debug_struct("AsyncRwMutex")
            .field("name", &self.core.name)
            .field("writers", &writers)
            .field("readers", &readers)
            .finish_non_exhaustive()
    }
}

fn contended(core: &Arc<LockCore>, info: &LockInfo) -> Watch {
    trace!(
        target: "lockwatch",
        lock = core.name.unwrap_or("<unnamed>"),
        task = %info.task,
        kind = %info.kind,
        "async lock contended"
    );
    Watch::register(core, info)
}

// ── Guards ──────────────────────────────────────────────

pub struct AsyncRwMutexReadGuard<'a, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    core: &'a LockCore,
    task: TaskId,
    holder_id: u64,
}

impl<T> Drop for AsyncRwMutexReadGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `guard` is never touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.core.registry.clear_read(self.task, self.holder_id);
    }
}

impl<T> Deref for AsyncRwMutexReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct AsyncRwMutexWriteGuard<'a, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    core: &'a LockCore,
    task: TaskId,
    holder_id: u64,
}

impl<T> Drop for AsyncRwMutexWriteGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `guard` is never touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.core.registry.clear_write(self.task, self.holder_id);
    }
}

impl<T> Deref for AsyncRwMutexWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for AsyncRwMutexWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
