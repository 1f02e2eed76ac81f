//! Process-wide stall monitor.
//!
//! Every acquisition that cannot be granted immediately publishes an entry in
//! the watch set for as long as it waits. A single background thread wakes up
//! periodically, finds entries that have been waiting longer than their
//! effective timeout, removes them and hands a [`StallReport`] to the
//! applicable handler. Handlers run one after another on a single dispatcher
//! thread, so a slow or panicking handler never holds up a scan. The monitor
//! never touches the locks themselves.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{self, StallHandler, TimeoutPolicy};
use crate::registry::{AcquireKind, CallSite, LastLocker, LockCore, LockInfo};
use crate::TaskId;

const MIN_SCALED_TIMEOUT: Duration = Duration::from_millis(50);
const FLOOR_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ── Watch set ───────────────────────────────────────────

struct WatchEntry {
    core: Arc<LockCore>,
    info: LockInfo,
}

static WATCH_SET: LazyLock<Mutex<HashMap<u64, WatchEntry>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Keeps a pending acquisition in the watch set until dropped.
///
/// Dropping happens on grant, or when an async acquisition is cancelled.
pub(crate) struct Watch {
    id: u64,
}

impl Watch {
    pub(crate) fn register(core: &Arc<LockCore>, info: &LockInfo) -> Self {
        ensure_started();

        let id = NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed);
        let overrides_global = {
            let own = core.lock_timeout();
            !own.is_zero() && own < config::global_lock_timeout()
        };
        WATCH_SET.lock().insert(
            id,
            WatchEntry {
                core: Arc::clone(core),
                info: info.clone(),
            },
        );
        if overrides_global {
            wake();
        }
        Self { id }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        WATCH_SET.lock().remove(&self.id);
    }
}

/// Forgets every pending acquisition without touching held locks or
/// configuration. Attempts that are still blocked will not be reported.
pub fn reset_global_timers() {
    let cleared = {
        let mut watch = WATCH_SET.lock();
        let cleared = watch.len();
        watch.clear();
        cleared
    };
    debug!(target: "lockwatch", cleared, "reset pending lock timers");
}

pub(crate) fn pending_for(core: &Arc<LockCore>) -> usize {
    WATCH_SET
        .lock()
        .values()
        .filter(|entry| Arc::ptr_eq(&entry.core, core))
        .count()
}

// ── Stall reports ───────────────────────────────────────

/// Describes an acquisition that has been waiting longer than its timeout.
#[derive(Debug, Clone)]
pub struct StallReport {
    lock_name: Option<&'static str>,
    kind: AcquireKind,
    task: TaskId,
    call_site: CallSite,
    elapsed: Duration,
    timeout: Duration,
    holder: Option<LastLocker>,
}

impl StallReport {
    pub fn lock_name(&self) -> Option<&'static str> {
        self.lock_name
    }

    pub fn kind(&self) -> AcquireKind {
        self.kind
    }

    /// The task whose acquisition is stuck.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Where the stuck acquisition was attempted.
    pub fn call_site(&self) -> CallSite {
        self.call_site
    }

    /// How long the acquisition had been waiting when it was reported.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A current holder of the lock at report time, if any.
    pub fn holder(&self) -> Option<LastLocker> {
        self.holder
    }
}

impl fmt::Display for StallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lock `{}` blocked for {:.3}s (timeout {:.3}s) at {} by {}",
            self.kind,
            self.lock_name.unwrap_or("<unnamed>"),
            self.elapsed.as_secs_f64(),
            self.timeout.as_secs_f64(),
            self.call_site,
            self.task
        )?;
        if let Some(holder) = &self.holder {
            write!(
                f,
                "; held by {} since {} for {:.3}s",
                holder.task,
                holder.call_site,
                holder.held_for.as_secs_f64()
            )?;
        }
        Ok(())
    }
}

// ── Monitor thread ──────────────────────────────────────

struct MonitorState {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

struct Monitor {
    running: AtomicBool,
    state: Mutex<MonitorState>,
    wake: Condvar,
}

static MONITOR: LazyLock<Monitor> = LazyLock::new(|| Monitor {
    running: AtomicBool::new(false),
    state: Mutex::new(MonitorState {
        handle: None,
        generation: 0,
    }),
    wake: Condvar::new(),
});

/// Starts the monitor thread unless it is already running. Safe to call
/// from any number of threads at once.
pub(crate) fn ensure_started() {
    let monitor = &*MONITOR;
    if monitor.running.load(Ordering::Acquire) {
        return;
    }

    let mut state = monitor.state.lock();
    if state.handle.is_some() {
        return;
    }

    let generation = state.generation;
    match thread::Builder::new()
        .name("lockwatch-monitor".to_string())
        .spawn(move || run_monitor_loop(generation))
    {
        Ok(handle) => {
            state.handle = Some(handle);
            monitor.running.store(true, Ordering::Release);
            debug!(target: "lockwatch", generation, "stall monitor started");
        }
        Err(e) => {
            error!(target: "lockwatch", %e, "failed to start stall monitor");
        }
    }
}

/// Stops the monitor thread and waits for it to exit.
///
/// The monitor normally lives for the whole process; this exists so tests
/// can isolate themselves. The next blocked acquisition starts a new monitor.
pub fn shutdown_monitor() {
    let monitor = &*MONITOR;
    let handle = {
        let mut state = monitor.state.lock();
        state.generation += 1;
        monitor.running.store(false, Ordering::Release);
        state.handle.take()
    };
    monitor.wake.notify_all();

    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!(target: "lockwatch", "stall monitor thread panicked");
        }
        debug!(target: "lockwatch", "stall monitor stopped");
    }
}

/// Cuts the current sleep short so the monitor re-reads its configuration.
pub(crate) fn wake() {
    let _state = MONITOR.state.lock();
    MONITOR.wake.notify_all();
}

fn run_monitor_loop(generation: u64) {
    let monitor = &*MONITOR;
    // Dropped when the loop exits, which ends the dispatcher too.
    let dispatcher = Dispatcher::start();
    loop {
        {
            let mut state = monitor.state.lock();
            if state.generation != generation {
                return;
            }
            // Computed under the state lock so a concurrent `wake` is not lost.
            let interval = poll_interval();
            monitor.wake.wait_for(&mut state, interval);
            if state.generation != generation {
                return;
            }
        }
        scan(Instant::now(), &dispatcher);
    }
}

/// A third of the governing timeout, or a fixed floor for very short (or
/// disabled) timeouts. The governing timeout is the global one, lowered to
/// the shortest per-lock override among pending acquisitions.
fn poll_interval() -> Duration {
    let global = config::global_policy();
    let mut governing = if global.is_enabled() {
        global.timeout
    } else {
        Duration::ZERO
    };

    let overrides: Vec<Arc<LockCore>> = WATCH_SET
        .lock()
        .values()
        .map(|entry| Arc::clone(&entry.core))
        .collect();
    for core in overrides {
        let own = core.lock_timeout();
        if !own.is_zero() && (governing.is_zero() || own < governing) {
            governing = own;
        }
    }

    interval_for(governing)
}

fn interval_for(timeout: Duration) -> Duration {
    if timeout > MIN_SCALED_TIMEOUT {
        timeout / 3
    } else {
        FLOOR_POLL_INTERVAL
    }
}

fn scan(now: Instant, dispatcher: &Dispatcher) {
    let global = config::global_policy();

    let mut overdue: Vec<(WatchEntry, TimeoutPolicy, Duration)> = {
        let mut watch = WATCH_SET.lock();
        let due: Vec<(u64, TimeoutPolicy, Duration)> = watch
            .iter()
            .filter_map(|(id, entry)| {
                let policy = entry.core.effective_policy(&global);
                if !policy.is_enabled() {
                    return None;
                }
                let elapsed = now.saturating_duration_since(entry.info.since);
                (elapsed > policy.timeout).then_some((*id, policy, elapsed))
            })
            .collect();
        due.into_iter()
            .filter_map(|(id, policy, elapsed)| {
                watch.remove(&id).map(|entry| (entry, policy, elapsed))
            })
            .collect()
    };
    overdue.sort_by_key(|(entry, _, _)| entry.info.since);

    for (entry, policy, elapsed) in overdue {
        let Some(handler) = policy.handler else {
            continue;
        };
        let report = StallReport {
            lock_name: entry.core.name,
            kind: entry.info.kind,
            task: entry.info.task,
            call_site: entry.info.call_site,
            elapsed,
            timeout: policy.timeout,
            holder: entry.core.registry.last_locker(),
        };
        dispatcher.dispatch(handler, report);
    }
}

// ── Handler dispatch ────────────────────────────────────

type Job = (StallHandler, StallReport);

/// Feeds reports to one long-lived `lockwatch-stall-handler` thread.
struct Dispatcher {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl Dispatcher {
    fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        match thread::Builder::new()
            .name("lockwatch-stall-handler".to_string())
            .spawn(move || run_dispatch_loop(rx))
        {
            Ok(_) => Self { tx: Some(tx) },
            Err(e) => {
                error!(
                    target: "lockwatch",
                    %e,
                    "failed to start stall handler thread, handlers will run on the monitor"
                );
                Self { tx: None }
            }
        }
    }

    fn dispatch(&self, handler: StallHandler, report: StallReport) {
        let (handler, report) = match &self.tx {
            Some(tx) => match tx.send((handler, report)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => (handler, report),
        };
        run_handler(&handler, &report);
    }
}

fn run_dispatch_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some((handler, report)) = rx.blocking_recv() {
        run_handler(&handler, &report);
    }
}

fn run_handler(handler: &StallHandler, report: &StallReport) {
    if panic::catch_unwind(AssertUnwindSafe(|| handler(report))).is_err() {
        warn!(
            target: "lockwatch",
            lock = report.lock_name.unwrap_or("<unnamed>"),
            "stall handler panicked"
        );
    }
}
