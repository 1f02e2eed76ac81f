//! Read/write locks that catch re-entrant acquisition and report stalls.
//!
//! [`RwMutex`] wraps `parking_lot::RwLock` and [`AsyncRwMutex`] wraps
//! `tokio::sync::RwLock`. Both keep a small ownership registry per lock,
//! keyed by [`TaskId`], and use it for two kinds of diagnostics:
//!
//! - **Re-entrancy.** A task that holds the write lock and asks for the lock
//!   again, or holds a read lock and asks for the write lock, would deadlock
//!   against itself. The attempt fails immediately with a [`LockError`]
//!   (`read`/`write` panic with it; the `*_checked` and `*_as` forms return
//!   it).
//! - **Stalls.** An acquisition that cannot be granted right away is
//!   published to a process-wide watch set. A background monitor thread
//!   reports any entry that waits longer than its timeout through a
//!   [`StallHandler`], once per blocked attempt.
//!
//! The global timeout defaults to 2s and can be set through
//! `LOCKWATCH_TIMEOUT_MS` or [`set_global_lock_timeout`]. Individual locks
//! can override it with `set_lock_timeout`.
//!
//! Nothing here ever aborts, preempts or force-releases a lock. A report is
//! a signal that a wait looks suspicious, not a proof of deadlock.

mod async_locks;
mod config;
mod error;
mod monitor;
mod registry;
mod sync_locks;
mod task_id;

pub use async_locks::{AsyncRwMutex, AsyncRwMutexReadGuard, AsyncRwMutexWriteGuard};
pub use config::{
    DEFAULT_LOCK_TIMEOUT, StallHandler, TIMEOUT_ENV, default_stall_handler, global_lock_timeout,
    set_global_lock_timeout, stall_handler,
};
pub use error::LockError;
pub use monitor::{StallReport, reset_global_timers, shutdown_monitor};
pub use registry::{AcquireKind, CallSite, LastLocker};
pub use sync_locks::{RwMutex, RwMutexReadGuard, RwMutexWriteGuard};
pub use task_id::TaskId;
