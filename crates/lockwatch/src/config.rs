//! Stall timeouts: one process-wide default plus optional per-lock overrides.
//!
//! The process default is read from `LOCKWATCH_TIMEOUT_MS` the first time it
//! is needed (`0` disables detection) and falls back to
//! [`DEFAULT_LOCK_TIMEOUT`]. The default handler logs a warning through
//! `tracing` and does nothing else.

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::StallReport;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
pub const TIMEOUT_ENV: &str = "LOCKWATCH_TIMEOUT_MS";

/// Called from the monitor's dispatch thread when an acquisition stalls.
pub type StallHandler = Arc<dyn Fn(&StallReport) + Send + Sync>;

/// Wraps a closure as a [`StallHandler`].
pub fn stall_handler(f: impl Fn(&StallReport) + Send + Sync + 'static) -> StallHandler {
    Arc::new(f)
}

pub fn default_stall_handler() -> StallHandler {
    stall_handler(|report| {
        warn!(
            target: "lockwatch",
            lock = report.lock_name().unwrap_or("<unnamed>"),
            task = %report.task(),
            elapsed_ms = report.elapsed().as_millis() as u64,
            "{report}"
        );
    })
}

#[derive(Clone)]
pub(crate) struct TimeoutPolicy {
    pub(crate) timeout: Duration,
    pub(crate) handler: Option<StallHandler>,
}

impl TimeoutPolicy {
    pub(crate) fn disabled() -> Self {
        Self {
            timeout: Duration::ZERO,
            handler: None,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.timeout.is_zero() && self.handler.is_some()
    }
}

impl fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("timeout", &self.timeout)
            .field("handler", &self.handler.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// A non-zero instance timeout wins; its handler falls back to the global one.
pub(crate) fn resolve(instance: &TimeoutPolicy, global: &TimeoutPolicy) -> TimeoutPolicy {
    if instance.timeout.is_zero() {
        return global.clone();
    }
    TimeoutPolicy {
        timeout: instance.timeout,
        handler: instance
            .handler
            .clone()
            .or_else(|| global.handler.clone()),
    }
}

static GLOBAL_POLICY: LazyLock<Mutex<TimeoutPolicy>> = LazyLock::new(|| {
    Mutex::new(TimeoutPolicy {
        timeout: timeout_from_env(),
        handler: Some(default_stall_handler()),
    })
});

fn timeout_from_env() -> Duration {
    let Some(raw) = std::env::var(TIMEOUT_ENV)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    else {
        return DEFAULT_LOCK_TIMEOUT;
    };
    match raw.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(e) => {
            warn!(target: "lockwatch", value = %raw, %e, "ignoring invalid {TIMEOUT_ENV}");
            DEFAULT_LOCK_TIMEOUT
        }
    }
}

/// Sets the process-wide stall timeout and handler.
///
/// A zero `timeout` or a `None` handler turns off detection for every lock
/// that has no override of its own. The monitor picks up the change on its
/// next cycle, including for acquisitions that are already waiting.
pub fn set_global_lock_timeout(timeout: Duration, handler: Option<StallHandler>) {
    *GLOBAL_POLICY.lock() = TimeoutPolicy { timeout, handler };
    crate::monitor::wake();
}

pub fn global_lock_timeout() -> Duration {
    GLOBAL_POLICY.lock().timeout
}

pub(crate) fn global_policy() -> TimeoutPolicy {
    GLOBAL_POLICY.lock().clone()
}
