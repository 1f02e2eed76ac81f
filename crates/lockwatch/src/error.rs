use std::fmt;

use crate::{CallSite, TaskId};

/// An illegal re-entrant acquisition, detected before blocking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The task already holds the write lock and asked for the lock again.
    DoubleLock {
        lock: Option<&'static str>,
        task: TaskId,
        held_at: CallSite,
        attempted_at: CallSite,
    },
    /// The task holds a read lock and asked for the write lock.
    LockAfterReadLock {
        lock: Option<&'static str>,
        task: TaskId,
        held_at: CallSite,
        attempted_at: CallSite,
    },
}

impl LockError {
    pub fn task(&self) -> TaskId {
        match self {
            Self::DoubleLock { task, .. } | Self::LockAfterReadLock { task, .. } => *task,
        }
    }

    /// Where the conflicting hold was acquired.
    pub fn held_at(&self) -> CallSite {
        match self {
            Self::DoubleLock { held_at, .. } | Self::LockAfterReadLock { held_at, .. } => *held_at,
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoubleLock {
                lock,
                task,
                held_at,
                attempted_at,
            } => write!(
                f,
                "double lock detected: {task} already holds write lock `{}` (acquired at {held_at}), attempted again at {attempted_at}",
                lock.unwrap_or("<unnamed>")
            ),
            Self::LockAfterReadLock {
                lock,
                task,
                held_at,
                attempted_at,
            } => write!(
                f,
                "lock after read lock: {task} holds read lock `{}` (acquired at {held_at}), attempted write at {attempted_at}",
                lock.unwrap_or("<unnamed>")
            ),
        }
    }
}

impl std::error::Error for LockError {}
