//! State watcher: multi-item periodic sampling with hysteresis and override.
//!
//! A [`StateWatcher`] runs one periodic tick at its base period and samples
//! each registered item at that item's own interval (a multiple of the
//! base).  Raw samples feed the hysteresis comparator; when a change is
//! confirmed the item's action callback is dispatched with the registry
//! lock released.  A time-bounded override ("forced state") can substitute
//! the sampler's output for testing and simulation; it bypasses hysteresis
//! and auto-expires.
//!
//! ```text
//! tick (base period)
//!   └── for each item due now
//!         ├── sampler()            lock released
//!         ├── override / hysteresis
//!         └── action(old, new)     lock released, Running re-checked
//! ```
//!
//! Samples and actions for one item are strictly ordered; actions for
//! different items in the same tick run in insertion order.  A callback
//! that blocks stalls this engine's tick until it returns — there is no
//! per-callback timeout.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::clock::{Clock, MonotonicClock, ms};
use crate::error::{Error, Result, StartOutcome, StopOutcome};
use crate::hysteresis::HysteresisFilter;
use crate::task::TickTask;

/// Default base scheduling granularity in milliseconds.
pub const DEFAULT_BASE_PERIOD_MS: u64 = 200;

/// Default hysteresis: immediate change recognition.
pub const DEFAULT_HYSTERESIS: u64 = 0;

/// Maximum item display-name length in characters; longer names truncate.
pub const ITEM_NAME_MAX: usize = 31;

/// Sampler callback: produces the current state value for an item.
///
/// Caller context travels by closure capture; the engine never owns it.
pub type Sampler = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Action callback: receives `(previous_action_state, new_state)`.
pub type Action = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Base scheduling granularity in ms; 0 resolves to
    /// [`DEFAULT_BASE_PERIOD_MS`].  All item periods must be positive
    /// multiples of this value.
    pub base_period_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            base_period_ms: DEFAULT_BASE_PERIOD_MS,
        }
    }
}

/// Stable handle to a watch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchItemId(u64);

impl fmt::Display for WatchItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a single watch item.
///
/// Built with [`WatchItemSpec::new`] plus the chained setters:
///
/// ```
/// use radiowatch_core::watch::WatchItemSpec;
///
/// let spec = WatchItemSpec::new(|| 0)
///     .name("link_state")
///     .period_ms(1_000)
///     .hysteresis(3)
///     .action(|old, new| println!("link {old} -> {new}"));
/// ```
#[derive(Clone)]
pub struct WatchItemSpec {
    name: Option<String>,
    period_ms: u64,
    hysteresis: u64,
    sampler: Sampler,
    action: Option<Action>,
}

impl WatchItemSpec {
    /// Create a spec with the required sampler and all defaults.
    #[must_use]
    pub fn new(sampler: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            name: None,
            period_ms: 0,
            hysteresis: DEFAULT_HYSTERESIS,
            sampler: Arc::new(sampler),
            action: None,
        }
    }

    /// Display name; auto-generated from the handle when absent.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sampling interval in ms; 0 resolves to the watcher's base period.
    #[must_use]
    pub fn period_ms(mut self, period_ms: u64) -> Self {
        self.period_ms = period_ms;
        self
    }

    /// Consecutive-count threshold; 0 disables filtering.
    #[must_use]
    pub fn hysteresis(mut self, hysteresis: u64) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    /// Action to dispatch on confirmed state changes.
    #[must_use]
    pub fn action(mut self, action: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }
}

impl fmt::Debug for WatchItemSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchItemSpec")
            .field("name", &self.name)
            .field("period_ms", &self.period_ms)
            .field("hysteresis", &self.hysteresis)
            .field("has_action", &self.action.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-item statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchItemStats {
    /// Total sampler invocations (including overridden ones).
    pub sample_count: u64,
    /// Total action dispatches.
    pub action_count: u64,
}

/// Aggregate watcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherStats {
    pub total_samples: u64,
    pub total_actions: u64,
    pub active_items: usize,
}

const LIFECYCLE_UNINITIALIZED: u8 = 0;
const LIFECYCLE_STOPPED: u8 = 1;
const LIFECYCLE_RUNNING: u8 = 2;

struct WatchItem {
    id: WatchItemId,
    name: String,
    period_ms: u64,
    sampler: Sampler,
    action: Option<Action>,
    filter: HysteresisFilter,
    current_state: u64,
    last_action_state: u64,
    last_sample_time: u64,
    forced_state: u64,
    forced_expiry_ms: u64,
    is_forced: bool,
    sample_count: u64,
    action_count: u64,
}

#[derive(Default)]
struct Registry {
    items: Vec<WatchItem>,
    total_samples: u64,
    total_actions: u64,
    next_id: u64,
}

impl Registry {
    fn find_mut(&mut self, id: WatchItemId) -> Option<&mut WatchItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn find(&self, id: WatchItemId) -> Option<&WatchItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

struct Inner {
    base_period_ms: u64,
    lifecycle: AtomicU8,
    registry: Mutex<Registry>,
    clock: Arc<dyn Clock>,
    tick: TickTask,
}

/// Multi-item sampling engine with per-item intervals, hysteresis and
/// forced-state override.
///
/// Cloning yields another handle to the same engine.  Re-entrancy: callbacks
/// run with no engine lock held, so any synchronous API — including
/// [`StateWatcher::remove_item`] on the item currently dispatching — may be
/// called from inside a callback.
#[derive(Clone)]
pub struct StateWatcher {
    inner: Arc<Inner>,
}

impl StateWatcher {
    /// Initialize a watcher in the Stopped state with no items.
    #[must_use]
    pub fn new(config: WatcherConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Initialize with an explicit time source.
    #[must_use]
    pub fn with_clock(config: WatcherConfig, clock: Arc<dyn Clock>) -> Self {
        let base_period_ms = if config.base_period_ms == 0 {
            DEFAULT_BASE_PERIOD_MS
        } else {
            config.base_period_ms
        };
        info!(base_period_ms, "state watcher initialized");
        Self {
            inner: Arc::new(Inner {
                base_period_ms,
                lifecycle: AtomicU8::new(LIFECYCLE_STOPPED),
                registry: Mutex::new(Registry::default()),
                clock,
                tick: TickTask::new(),
            }),
        }
    }

    /// The resolved base scheduling granularity in ms.
    #[must_use]
    pub fn base_period_ms(&self) -> u64 {
        self.inner.base_period_ms
    }

    /// Whether the periodic tick is currently active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_RUNNING
    }

    /// Transition Stopped → Running and schedule the first tick one base
    /// period from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInitialized`] after [`StateWatcher::cleanup`].
    pub fn start(&self) -> Result<StartOutcome> {
        match self.inner.lifecycle.compare_exchange(
            LIFECYCLE_STOPPED,
            LIFECYCLE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(LIFECYCLE_RUNNING) => return Ok(StartOutcome::AlreadyRunning),
            Err(_) => return Err(Error::NotInitialized),
        }

        let inner = Arc::clone(&self.inner);
        self.inner.tick.spawn(move |mut shutdown| async move {
            let period = ms(inner.base_period_ms);
            let mut next = Instant::now() + period;
            loop {
                tokio::select! {
                    () = tokio::time::sleep_until(next) => {}
                    _ = shutdown.changed() => break,
                }
                if inner.lifecycle.load(Ordering::SeqCst) != LIFECYCLE_RUNNING {
                    break;
                }
                let tick_started = Instant::now();
                if !inner.run_tick() {
                    break;
                }
                next = tick_started + period;
            }
        });

        info!("state watcher started");
        Ok(StartOutcome::Started)
    }

    /// Transition Running → Stopped and wait for any in-flight tick to
    /// complete.  After this returns no further callback is invoked until
    /// the next `start`.
    pub async fn stop(&self) -> StopOutcome {
        if self
            .inner
            .lifecycle
            .compare_exchange(
                LIFECYCLE_RUNNING,
                LIFECYCLE_STOPPED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return StopOutcome::AlreadyStopped;
        }
        self.inner.tick.cancel_sync().await;
        info!("state watcher stopped");
        StopOutcome::Stopped
    }

    /// Stop (idempotent), drop all items and return the watcher to the
    /// uninitialized state.
    pub async fn cleanup(&self) {
        if self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_UNINITIALIZED {
            return;
        }
        let _ = self.stop().await;
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.items.clear();
            registry.total_samples = 0;
            registry.total_actions = 0;
        }
        self.inner
            .lifecycle
            .store(LIFECYCLE_UNINITIALIZED, Ordering::SeqCst);
        info!("state watcher cleaned up");
    }

    /// Add a watch item.
    ///
    /// A zero `period_ms` resolves to the base period; otherwise the period
    /// must be a multiple of the base and at least the base.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] on an invalid period,
    /// [`Error::NotInitialized`] after cleanup.  No side effects on failure.
    pub fn add_item(&self, spec: WatchItemSpec) -> Result<WatchItemId> {
        if self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_UNINITIALIZED {
            return Err(Error::NotInitialized);
        }

        let base = self.inner.base_period_ms;
        let period_ms = if spec.period_ms == 0 {
            base
        } else {
            spec.period_ms
        };
        if period_ms % base != 0 {
            return Err(Error::invalid(format!(
                "period {period_ms} ms is not a multiple of base period {base} ms"
            )));
        }
        if period_ms < base {
            return Err(Error::invalid(format!(
                "period {period_ms} ms is below base period {base} ms"
            )));
        }

        let now = self.inner.clock.now_ms();
        let mut registry = self.inner.registry.lock().unwrap();
        let id = WatchItemId(registry.next_id);
        registry.next_id += 1;

        let name = match spec.name {
            Some(name) => truncate_name(&name),
            None => format!("item_{id}"),
        };

        registry.items.push(WatchItem {
            id,
            name: name.clone(),
            period_ms,
            sampler: spec.sampler,
            action: spec.action,
            filter: HysteresisFilter::new(spec.hysteresis),
            current_state: 0,
            last_action_state: 0,
            last_sample_time: now,
            forced_state: 0,
            forced_expiry_ms: 0,
            is_forced: false,
            sample_count: 0,
            action_count: 0,
        });
        drop(registry);

        info!(
            item = %name,
            period_ms,
            hysteresis = spec.hysteresis,
            "watch item added"
        );
        Ok(id)
    }

    /// Detach and destroy a watch item.
    ///
    /// Safe to call while the watcher is running, including from inside the
    /// item's own action callback.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a stale handle.
    pub fn remove_item(&self, id: WatchItemId) -> Result<()> {
        let mut registry = self.inner.registry.lock().unwrap();
        let index = registry
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        let item = registry.items.remove(index);
        drop(registry);
        info!(item = %item.name, "watch item removed");
        Ok(())
    }

    /// Latest sampler output (or forced value) recorded for the item.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a stale handle.
    pub fn get_item_state(&self, id: WatchItemId) -> Result<u64> {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .find(id)
            .map(|item| item.current_state)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))
    }

    /// Per-item sample and action counters.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a stale handle.
    pub fn get_item_stats(&self, id: WatchItemId) -> Result<WatchItemStats> {
        let registry = self.inner.registry.lock().unwrap();
        registry
            .find(id)
            .map(|item| WatchItemStats {
                sample_count: item.sample_count,
                action_count: item.action_count,
            })
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))
    }

    /// Aggregate counters and the current item count.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] after cleanup.
    pub fn stats(&self) -> Result<WatcherStats> {
        if self.inner.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_UNINITIALIZED {
            return Err(Error::NotInitialized);
        }
        let registry = self.inner.registry.lock().unwrap();
        Ok(WatcherStats {
            total_samples: registry.total_samples,
            total_actions: registry.total_actions,
            active_items: registry.items.len(),
        })
    }

    /// Force the item to report `value` for `duration_ms`.
    ///
    /// The sampler keeps running (and is counted) but its output is
    /// discarded while the override is active.  Hysteresis is bypassed:
    /// any overridden value differing from the action baseline fires on the
    /// next due sample.  Re-arming overwrites the previous override.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] when `duration_ms` is 0,
    /// [`Error::NotFound`] for a stale handle.
    pub fn force_state(&self, id: WatchItemId, value: u64, duration_ms: u64) -> Result<()> {
        if duration_ms == 0 {
            return Err(Error::invalid("forced-state duration must be positive"));
        }
        let now = self.inner.clock.now_ms();
        let mut registry = self.inner.registry.lock().unwrap();
        let item = registry
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        item.forced_state = value;
        item.forced_expiry_ms = now.saturating_add(duration_ms);
        item.is_forced = true;
        info!(item = %item.name, value, duration_ms, "forced state armed");
        Ok(())
    }

    /// Deactivate an override and resume normal sampling.
    ///
    /// The hysteresis scratch is left untouched; the next raw sample
    /// resumes the normal filter.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a stale handle.
    pub fn clear_forced_state(&self, id: WatchItemId) -> Result<()> {
        let mut registry = self.inner.registry.lock().unwrap();
        let item = registry
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        if item.is_forced {
            item.is_forced = false;
            info!(item = %item.name, "forced state cleared");
        }
        Ok(())
    }

    /// Whether an override is active, and the remaining ms if so.
    ///
    /// A deadline that has already passed is cleared eagerly here.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for a stale handle.
    pub fn is_state_forced(&self, id: WatchItemId) -> Result<Option<u64>> {
        let now = self.inner.clock.now_ms();
        let mut registry = self.inner.registry.lock().unwrap();
        let item = registry
            .find_mut(id)
            .ok_or_else(|| Error::NotFound(format!("watch item {id}")))?;
        if item.is_forced && now > item.forced_expiry_ms {
            item.is_forced = false;
            debug!(item = %item.name, "forced state expired during check");
        }
        if item.is_forced {
            Ok(Some(item.forced_expiry_ms.saturating_sub(now)))
        } else {
            Ok(None)
        }
    }
}

impl Inner {
    /// Execute one scheduler tick.
    ///
    /// Returns `false` when a stop was observed while the registry lock was
    /// released, in which case the caller abandons the tick without
    /// rescheduling.
    fn run_tick(&self) -> bool {
        let t = self.clock.now_ms();

        let due: Vec<WatchItemId> = {
            let registry = self.registry.lock().unwrap();
            registry
                .items
                .iter()
                .filter(|item| t >= item.last_sample_time.saturating_add(item.period_ms))
                .map(|item| item.id)
                .collect()
        };

        for id in due {
            // Resolve the sampler under the lock, then release it to sample.
            let sampler = {
                let mut registry = self.registry.lock().unwrap();
                let Some(item) = registry.find_mut(id) else {
                    continue;
                };
                if item.is_forced && t > item.forced_expiry_ms {
                    item.is_forced = false;
                    debug!(item = %item.name, "forced state expired, resuming normal sampling");
                }
                Arc::clone(&item.sampler)
            };

            let raw = catch_unwind(AssertUnwindSafe(|| sampler())).ok();

            // Re-acquire and re-resolve: the item may have been removed
            // while the sampler ran.
            let dispatch = {
                let mut registry = self.registry.lock().unwrap();
                registry.total_samples += 1;
                let Some(item) = registry.find_mut(id) else {
                    continue;
                };
                item.sample_count += 1;

                let Some(raw) = raw else {
                    error!(item = %item.name, "sampler panicked; keeping previous state");
                    item.last_sample_time = t;
                    continue;
                };

                let new_state = if item.is_forced {
                    item.forced_state
                } else {
                    raw
                };
                let fire = if item.is_forced {
                    // Override bypasses hysteresis: raw inequality with the baseline.
                    item.last_action_state != new_state
                } else {
                    item.filter.observe(item.last_action_state, new_state)
                };

                match (&item.action, fire) {
                    (Some(action), true) => Some((
                        Arc::clone(action),
                        item.name.clone(),
                        item.last_action_state,
                        new_state,
                    )),
                    _ => {
                        item.current_state = new_state;
                        item.last_sample_time = t;
                        None
                    }
                }
            };

            if let Some((action, name, old_state, new_state)) = dispatch {
                debug!(item = %name, old_state, new_state, "state change, dispatching action");
                if catch_unwind(AssertUnwindSafe(|| action(old_state, new_state))).is_err() {
                    error!(item = %name, "action callback panicked");
                }

                let mut registry = self.registry.lock().unwrap();
                if self.lifecycle.load(Ordering::SeqCst) != LIFECYCLE_RUNNING {
                    return false;
                }
                registry.total_actions += 1;
                if let Some(item) = registry.find_mut(id) {
                    item.last_action_state = new_state;
                    item.action_count += 1;
                    item.current_state = new_state;
                    item.last_sample_time = t;
                }
            }
        }

        true
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(ITEM_NAME_MAX).collect()
}
