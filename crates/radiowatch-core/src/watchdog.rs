//! Adaptive watchdog: on-demand timeout supervision with auto-tuned period.
//!
//! Items register a timeout and a recovery callback.  `start` arms an item
//! lock-free; a single supervision task checks armed items each tick and
//! invokes the recovery callback on every tick once the timeout has
//! elapsed, until `cancel` or `remove`.  The tick period tracks the
//! shortest registered timeout (`max(min_timeout / 2, 100 ms)`) and the
//! task goes idle when the registry empties, so an unused watchdog costs
//! nothing.
//!
//! ```text
//! add ──► recompute period ──► wake/park supervision task
//! start ──► start_time (Relaxed) then active (Release)
//! tick  ──► active (Acquire) then start_time; elapsed >= timeout ⇒ recovery()
//! ```
//!
//! Registering a timeout below [`WATCHDOG_MIN_TIMEOUT_MS`] is a programmer
//! error and panics: the supervisor cannot honor sub-minimum timeouts
//! without unbounded tick rates.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, MonotonicClock, ms};
use crate::error::{Error, Result};
use crate::task::TickTask;

/// Minimum accepted item timeout in milliseconds.
pub const WATCHDOG_MIN_TIMEOUT_MS: u64 = 200;

/// Floor for the supervision period: the tick never runs more often than
/// this, regardless of how short the registered timeouts are.
pub const WATCHDOG_MAX_WORK_PERIOD_MS: u64 = WATCHDOG_MIN_TIMEOUT_MS / 2;

/// Recovery callback invoked on and after timeout.
///
/// Caller context travels by closure capture; the engine never owns it.
pub type Recovery = Arc<dyn Fn() + Send + Sync>;

struct WdItem {
    timeout_ms: u64,
    /// Monotonic ms when the item was armed; published before `active`.
    start_time: AtomicU64,
    active: AtomicBool,
    /// Authoritative lifetime flag: false means tombstoned, never dispatch.
    valid: AtomicBool,
    recovery: Recovery,
}

/// Cloneable handle to a watchdog item.
#[derive(Clone)]
pub struct WatchdogItem {
    inner: Arc<WdItem>,
}

impl WatchdogItem {
    /// The item's configured timeout in ms.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        self.inner.timeout_ms
    }

    /// Whether the item is currently armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether the handle still refers to a live registry entry.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for WatchdogItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogItem")
            .field("timeout_ms", &self.inner.timeout_ms)
            .field("active", &self.is_active())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Introspection snapshot of the supervision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStats {
    /// Current tick interval; 0 when idle.
    pub period_ms: u64,
    /// Whether a tick is scheduled.
    pub work_active: bool,
    /// Number of live items.
    pub active_items: usize,
}

struct WatchdogInner {
    initialized: AtomicBool,
    registry: Mutex<Vec<Arc<WdItem>>>,
    period_ms: AtomicU64,
    work_active: AtomicBool,
    /// Wakes the supervision task when the period changes or the registry
    /// empties/refills.
    reschedule: watch::Sender<()>,
    clock: Arc<dyn Clock>,
    tick: TickTask,
}

/// On-demand timeout supervisor.
///
/// Cloning yields another handle to the same supervisor.  `add`/`remove`
/// serialize on the registry lock; `start`/`cancel` are lock-free atomic
/// operations safe on hot paths.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    /// Initialize an idle watchdog: no items, no scheduled tick.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Initialize with an explicit time source.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (reschedule, _) = watch::channel(());
        info!("watchdog initialized");
        Self {
            inner: Arc::new(WatchdogInner {
                initialized: AtomicBool::new(true),
                registry: Mutex::new(Vec::new()),
                period_ms: AtomicU64::new(0),
                work_active: AtomicBool::new(false),
                reschedule,
                clock,
                tick: TickTask::new(),
            }),
        }
    }

    /// Current tick interval in ms (0 when idle).
    #[must_use]
    pub fn period_ms(&self) -> u64 {
        self.inner.period_ms.load(Ordering::SeqCst)
    }

    /// Whether a tick is currently scheduled.
    #[must_use]
    pub fn is_work_active(&self) -> bool {
        self.inner.work_active.load(Ordering::SeqCst)
    }

    /// Snapshot of the supervision state.
    #[must_use]
    pub fn stats(&self) -> WatchdogStats {
        let active_items = self
            .inner
            .registry
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.valid.load(Ordering::Acquire))
            .count();
        WatchdogStats {
            period_ms: self.period_ms(),
            work_active: self.is_work_active(),
            active_items,
        }
    }

    /// Register a watchdog item in the inactive state.
    ///
    /// Triggers period recomputation; the first item schedules the tick.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] after [`Watchdog::deinit`].
    ///
    /// # Panics
    ///
    /// Panics when `timeout_ms < WATCHDOG_MIN_TIMEOUT_MS`.  This is the
    /// contract for a programmer error, not a recoverable condition.
    pub fn add(
        &self,
        timeout_ms: u64,
        recovery: impl Fn() + Send + Sync + 'static,
    ) -> Result<WatchdogItem> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        assert!(
            timeout_ms >= WATCHDOG_MIN_TIMEOUT_MS,
            "watchdog timeout {timeout_ms} ms is below the {WATCHDOG_MIN_TIMEOUT_MS} ms minimum"
        );

        let item = Arc::new(WdItem {
            timeout_ms,
            start_time: AtomicU64::new(0),
            active: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            recovery: Arc::new(recovery),
        });
        self.inner.registry.lock().unwrap().push(Arc::clone(&item));
        self.recompute_period();

        debug!(timeout_ms, "watchdog item added");
        Ok(WatchdogItem { inner: item })
    }

    /// Tombstone and detach an item.
    ///
    /// The item is marked invalid before it is unlinked, so a concurrent
    /// tick never dispatches it again.  Recomputes the period; removing the
    /// last item parks the tick.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] after deinit, [`Error::InvalidArgument`]
    /// for an already-removed handle.
    pub fn remove(&self, item: &WatchdogItem) -> Result<()> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        {
            let mut registry = self.inner.registry.lock().unwrap();
            if !item.inner.valid.load(Ordering::Acquire) {
                return Err(Error::invalid("watchdog item already removed"));
            }
            item.inner.valid.store(false, Ordering::Release);
            registry.retain(|entry| !Arc::ptr_eq(entry, &item.inner));
        }
        self.recompute_period();
        debug!(timeout_ms = item.inner.timeout_ms, "watchdog item removed");
        Ok(())
    }

    /// Arm an item ("start-once").
    ///
    /// The first call records the baseline `start_time`; further calls
    /// while armed are no-ops, so a timeout cannot be extended by repeated
    /// starts.  Lock-free.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] after deinit, [`Error::InvalidArgument`]
    /// for a removed handle.
    pub fn start(&self, item: &WatchdogItem) -> Result<()> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        if !item.inner.valid.load(Ordering::Acquire) {
            return Err(Error::invalid("watchdog item is no longer valid"));
        }
        if !item.inner.active.load(Ordering::Acquire) {
            // Publish start_time before active so the tick never observes
            // active with a stale baseline.
            item.inner
                .start_time
                .store(self.inner.clock.now_ms(), Ordering::Relaxed);
            item.inner.active.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Disarm an item.  Lock-free.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] after deinit, [`Error::InvalidArgument`]
    /// for a removed handle.
    pub fn cancel(&self, item: &WatchdogItem) -> Result<()> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        if !item.inner.valid.load(Ordering::Acquire) {
            return Err(Error::invalid("watchdog item is no longer valid"));
        }
        item.inner.active.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Tombstone every item, drop the registry and cancel the tick.
    ///
    /// Idempotent; operations after deinit fail `NotInitialized`.
    pub async fn deinit(&self) {
        if self
            .inner
            .initialized
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.work_active.store(false, Ordering::SeqCst);
        self.inner.period_ms.store(0, Ordering::SeqCst);
        {
            let mut registry = self.inner.registry.lock().unwrap();
            for item in registry.iter() {
                item.valid.store(false, Ordering::Release);
            }
            registry.clear();
        }
        self.inner.tick.cancel_sync().await;
        info!("watchdog deinitialized");
    }

    /// Recompute the tick period from the shortest valid timeout and
    /// wake, park or spawn the supervision task accordingly.
    fn recompute_period(&self) {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return;
        }

        let min_timeout = {
            let registry = self.inner.registry.lock().unwrap();
            registry
                .iter()
                .filter(|item| item.valid.load(Ordering::Acquire))
                .map(|item| item.timeout_ms)
                .min()
        };

        match min_timeout {
            Some(min) => {
                let new_period = (min / 2).max(WATCHDOG_MAX_WORK_PERIOD_MS);
                let old_period = self.inner.period_ms.swap(new_period, Ordering::SeqCst);
                let was_active = self.inner.work_active.swap(true, Ordering::SeqCst);

                if self.spawn_supervisor_if_idle() {
                    debug!(period_ms = new_period, "watchdog tick scheduled");
                } else if !was_active || old_period != new_period {
                    let _ = self.inner.reschedule.send(());
                    debug!(
                        old_period_ms = old_period,
                        period_ms = new_period,
                        "watchdog period updated"
                    );
                }
            }
            None => {
                self.inner.work_active.store(false, Ordering::SeqCst);
                self.inner.period_ms.store(0, Ordering::SeqCst);
                let _ = self.inner.reschedule.send(());
                debug!("watchdog idle, tick parked");
            }
        }
    }

    /// Spawn the long-lived supervision task unless one is already live.
    /// It ticks while work is active, parks while the registry is empty
    /// and exits on deinit.
    fn spawn_supervisor_if_idle(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        self.inner.tick.spawn_if_idle(move |mut shutdown| async move {
            let mut reschedule = inner.reschedule.subscribe();
            loop {
                if !inner.initialized.load(Ordering::SeqCst) {
                    break;
                }
                if inner.work_active.load(Ordering::SeqCst) {
                    let period = inner.period_ms.load(Ordering::SeqCst);
                    tokio::select! {
                        () = tokio::time::sleep(ms(period)) => {
                            if inner.initialized.load(Ordering::SeqCst)
                                && inner.work_active.load(Ordering::SeqCst)
                            {
                                inner.run_tick();
                            }
                        }
                        _ = reschedule.changed() => {}
                        _ = shutdown.changed() => break,
                    }
                } else {
                    tokio::select! {
                        _ = reschedule.changed() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        })
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogInner {
    fn run_tick(&self) {
        let t = self.clock.now_ms();

        // Snapshot under the lock; dispatch with it released.  Insertion
        // order is preserved, so recoveries in one tick are serialized in
        // registration order.
        let snapshot: Vec<Arc<WdItem>> = self.registry.lock().unwrap().clone();

        for item in snapshot {
            // Acquire on active pairs with the Release in start, making the
            // start_time read below coherent with the armed flag.
            if !item.valid.load(Ordering::Acquire) || !item.active.load(Ordering::Acquire) {
                continue;
            }
            let started = item.start_time.load(Ordering::Relaxed);
            let elapsed = t.saturating_sub(started);
            if elapsed < item.timeout_ms {
                continue;
            }
            // Re-check validity immediately before dispatch: the item may
            // have been removed while an earlier recovery ran.
            if !item.valid.load(Ordering::Acquire) {
                continue;
            }
            warn!(
                timeout_ms = item.timeout_ms,
                elapsed_ms = elapsed,
                "watchdog timeout, invoking recovery"
            );
            if catch_unwind(AssertUnwindSafe(|| (item.recovery)())).is_err() {
                error!("recovery callback panicked");
            }
            // `active` stays set: recovery repeats every tick until the
            // item is cancelled or removed.
        }
    }
}
