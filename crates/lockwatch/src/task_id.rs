use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EXPLICIT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TASK_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Identifies the execution unit that owns (or wants) a lock.
///
/// Re-entrancy checks compare the `TaskId` of an acquisition attempt against
/// the ids already recorded as holders of the same lock. Ids are stable for
/// the lifetime of the unit and unique among live units; an id may be reused
/// only through [`TaskId::explicit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// An OS thread outside any tokio task.
    Thread(u64),
    /// A tokio task, as reported by `tokio::task::try_id`.
    Tokio(tokio::task::Id),
    /// A caller-supplied identity, used with the `*_as` lock methods.
    Explicit(u64),
}

impl TaskId {
    /// Ambient identity of the caller: the current tokio task if there is one,
    /// otherwise the current thread.
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Tokio(id),
            None => Self::current_thread(),
        }
    }

    /// Identity of the current OS thread, ignoring any tokio task context.
    pub fn current_thread() -> Self {
        THREAD_TASK_ID.with(|id| Self::Thread(*id))
    }

    /// Allocates a new explicit identity that no other call to `fresh` will
    /// return.
    pub fn fresh() -> Self {
        Self::Explicit(NEXT_EXPLICIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a caller-managed raw identifier.
    pub const fn explicit(raw: u64) -> Self {
        Self::Explicit(raw)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(id) => write!(f, "thread#{id}"),
            Self::Tokio(id) => write!(f, "task#{id}"),
            Self::Explicit(id) => write!(f, "explicit#{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_identity_is_stable_within_a_thread() {
        assert_eq!(TaskId::current(), TaskId::current());
        assert_eq!(TaskId::current_thread(), TaskId::current_thread());
    }

    #[test]
    fn distinct_threads_get_distinct_ids() {
        let here = TaskId::current();
        let there = std::thread::spawn(TaskId::current)
            .join()
            .expect("identity thread should not panic");
        assert_ne!(here, there);
    }

    #[test]
    fn fresh_ids_never_repeat() {
        let a = TaskId::fresh();
        let b = TaskId::fresh();
        assert_ne!(a, b);
        assert!(matches!(a, TaskId::Explicit(_)));
    }

    #[tokio::test]
    async fn spawned_tasks_use_tokio_ids() {
        let first = tokio::spawn(async { TaskId::current() })
            .await
            .expect("task should complete");
        let second = tokio::spawn(async { TaskId::current() })
            .await
            .expect("task should complete");
        assert!(matches!(first, TaskId::Tokio(_)));
        assert_ne!(first, second);
    }
}
