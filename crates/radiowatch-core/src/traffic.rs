//! Per-interface traffic sampler with overflow-safe per-second rates.
//!
//! A [`TrafficSampler`] tracks a configured set of target interface names.
//! Device up/down/unregister notifications register and unregister entries
//! automatically; a periodic tick snapshots each device's counters so that
//! every entry always holds a `(previous, current)` snapshot pair.  Queries
//! turn a pair into per-second rates with wrap-aware deltas.
//!
//! ```text
//! device event ──► register / unregister (exclusive lock)
//! tick          ──► previous := current; current := read  (exclusive lock)
//! delta_single  ──► per-second rates from the pair        (shared lock)
//! ```
//!
//! The tick starts lazily with the first registered interface and parks
//! while nothing is monitored.  `cleanup` raises the `stopping` barrier:
//! event handlers observing it drop their work without touching the
//! registry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock, ms};
use crate::error::{Error, Result};
use crate::rate::{per_second, wrapping_delta};
use crate::task::TickTask;

/// Default sampling interval in milliseconds.
pub const TRAFFIC_SAMPLE_PERIOD_MS: u64 = 100;

/// Maximum interface-name length in bytes.
pub const IFNAME_MAX: usize = 15;

/// Counter snapshot for one interface, and the unit of rate reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl DeviceStats {
    /// Elementwise saturating sum, used when aggregating across interfaces.
    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            tx_packets: self.tx_packets.saturating_add(other.tx_packets),
            tx_bytes: self.tx_bytes.saturating_add(other.tx_bytes),
            rx_packets: self.rx_packets.saturating_add(other.rx_packets),
            rx_bytes: self.rx_bytes.saturating_add(other.rx_bytes),
        }
    }
}

/// Per-second rates between two counter snapshots.
///
/// `dt` is computed wrap-aware from the two timestamps; a zero interval
/// yields all-zero rates rather than dividing.
#[must_use]
pub fn per_second_rates(
    previous: &DeviceStats,
    current: &DeviceStats,
    previous_ts_ms: u64,
    current_ts_ms: u64,
) -> DeviceStats {
    let dt_ms = wrapping_delta(current_ts_ms, previous_ts_ms);
    DeviceStats {
        tx_packets: per_second(wrapping_delta(current.tx_packets, previous.tx_packets), dt_ms),
        tx_bytes: per_second(wrapping_delta(current.tx_bytes, previous.tx_bytes), dt_ms),
        rx_packets: per_second(wrapping_delta(current.rx_packets, previous.rx_packets), dt_ms),
        rx_bytes: per_second(wrapping_delta(current.rx_bytes, previous.rx_bytes), dt_ms),
    }
}

/// A monitored device exposed by the host.
///
/// The registry holds an `Arc` reference for the lifetime of the entry, so
/// a device cannot disappear out from under a registered interface.
pub trait Device: Send + Sync {
    /// Primary counter read; `None` when the device has no primary source.
    fn read_stats(&self) -> Option<DeviceStats>;

    /// Fallback counters, always available.
    fn read_stats_fallback(&self) -> DeviceStats;
}

/// Host-side device directory consulted on registration.
pub trait DeviceProvider: Send + Sync {
    /// Resolve an interface name to a device handle.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Device>>;
}

/// Device lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEvent {
    /// Interface came up; targeted names are registered.
    Up,
    /// Interface is going down through the normal path.
    GoingDown,
    /// Interface disappeared; backup cleanup for abnormal removal.
    Unregister,
}

/// One device notification as delivered on the event subscription.
#[derive(Debug, Clone)]
pub struct DeviceNotification {
    pub name: String,
    pub event: DeviceEvent,
}

/// Traffic sampler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Sampling interval in ms; 0 resolves to [`TRAFFIC_SAMPLE_PERIOD_MS`].
    pub sample_period_ms: u64,
    /// Interface names eligible for automatic registration on device-up.
    pub targets: Vec<String>,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            sample_period_ms: TRAFFIC_SAMPLE_PERIOD_MS,
            targets: Vec::new(),
        }
    }
}

struct IfaceEntry {
    device: Arc<dyn Device>,
    current: DeviceStats,
    previous: DeviceStats,
    current_ts_ms: u64,
    previous_ts_ms: u64,
}

struct TrafficInner {
    provider: Arc<dyn DeviceProvider>,
    targets: HashSet<String>,
    sample_period_ms: u64,
    entries: RwLock<HashMap<String, IfaceEntry>>,
    active_count: AtomicUsize,
    stopping: AtomicBool,
    /// Wakes a parked tick when the first interface registers.
    wake: watch::Sender<()>,
    clock: Arc<dyn Clock>,
    tick: TickTask,
    events: TickTask,
}

/// Hash-indexed per-interface counter sampler.
///
/// Cloning yields another handle to the same sampler.  Statistics queries
/// take the registry's shared lock; registration, unregistration and the
/// periodic snapshot take the exclusive lock.
#[derive(Clone)]
pub struct TrafficSampler {
    inner: Arc<TrafficInner>,
}

impl TrafficSampler {
    /// Prepare the registry with a cleared stopping flag and no entries.
    #[must_use]
    pub fn new(provider: Arc<dyn DeviceProvider>, config: TrafficConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(MonotonicClock::new()))
    }

    /// Prepare with an explicit time source.
    #[must_use]
    pub fn with_clock(
        provider: Arc<dyn DeviceProvider>,
        config: TrafficConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sample_period_ms = if config.sample_period_ms == 0 {
            TRAFFIC_SAMPLE_PERIOD_MS
        } else {
            config.sample_period_ms
        };
        let (wake, _) = watch::channel(());
        info!(
            sample_period_ms,
            targets = config.targets.len(),
            "traffic sampler initialized"
        );
        Self {
            inner: Arc::new(TrafficInner {
                provider,
                targets: config.targets.into_iter().collect(),
                sample_period_ms,
                entries: RwLock::new(HashMap::new()),
                active_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                wake,
                clock,
                tick: TickTask::new(),
                events: TickTask::new(),
            }),
        }
    }

    /// Number of currently monitored interfaces.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active_count.load(Ordering::SeqCst)
    }

    /// Whether the shutdown barrier has been raised.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Whether the sampling task is currently scheduled.
    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.inner.tick.is_scheduled()
    }

    /// Whether a name is eligible for automatic registration.
    #[must_use]
    pub fn is_target(&self, name: &str) -> bool {
        self.inner.targets.contains(name)
    }

    /// Subscribe to a stream of device notifications.
    ///
    /// The listener task forwards each notification to
    /// [`TrafficSampler::handle_device_event`] and exits when the channel
    /// closes or on `cleanup`.
    pub fn attach_events(&self, mut rx: broadcast::Receiver<DeviceNotification>) {
        let sampler = self.clone();
        self.inner.events.spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Ok(note) => sampler.handle_device_event(&note.name, note.event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "device event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// React to a device lifecycle event.
    ///
    /// Non-targeted names are ignored, and nothing is touched once the
    /// stopping barrier is up.  Failures on this path are logged, never
    /// propagated.
    pub fn handle_device_event(&self, name: &str, event: DeviceEvent) {
        if self.is_stopping() || !self.is_target(name) {
            return;
        }
        match event {
            DeviceEvent::Up => {
                debug!(device = name, "target device up, registering");
                match self.register(name) {
                    Ok(()) | Err(Error::Exists(_)) => {}
                    Err(err) => warn!(device = name, error = %err, "device-up registration failed"),
                }
            }
            DeviceEvent::GoingDown => {
                debug!(device = name, "target device going down, unregistering");
                let _ = self.unregister(name);
            }
            DeviceEvent::Unregister => {
                // Backup cleanup for abnormal removal; duplicate-safe.
                debug!(device = name, "target device unregistered, backup cleanup");
                let _ = self.unregister(name);
            }
        }
    }

    /// Register an interface for monitoring and ensure the tick runs.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for an empty or over-long name,
    /// [`Error::NotFound`] when the provider does not know the name,
    /// [`Error::Exists`] when already registered,
    /// [`Error::NotInitialized`] after `cleanup`.
    pub fn register(&self, name: &str) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::NotInitialized);
        }
        if name.is_empty() || name.len() > IFNAME_MAX {
            return Err(Error::invalid(format!(
                "interface name must be 1..={IFNAME_MAX} bytes"
            )));
        }

        let device = self
            .inner
            .provider
            .lookup(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        {
            let mut entries = self.inner.entries.write().unwrap();
            if entries.contains_key(name) {
                return Err(Error::Exists(name.to_string()));
            }
            entries.insert(
                name.to_string(),
                IfaceEntry {
                    device,
                    current: DeviceStats::default(),
                    previous: DeviceStats::default(),
                    current_ts_ms: 0,
                    previous_ts_ms: 0,
                },
            );
        }
        self.inner.active_count.fetch_add(1, Ordering::SeqCst);
        self.ensure_tick();

        info!(device = name, "interface registered for monitoring");
        Ok(())
    }

    /// Detach an interface and release its device reference.
    ///
    /// Duplicate unregistration is a success, matching the event paths that
    /// may fire both `GoingDown` and `Unregister` for one device.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let removed = self.inner.entries.write().unwrap().remove(name);
        if removed.is_some() {
            self.inner.active_count.fetch_sub(1, Ordering::SeqCst);
            info!(device = name, "interface unregistered");
        } else {
            debug!(device = name, "interface already unregistered");
        }
        Ok(())
    }

    /// Per-second rate snapshot for one interface.
    ///
    /// Returns a zero snapshot when the interface is not monitored; that is
    /// logged but not an error to the caller.
    #[must_use]
    pub fn delta_single(&self, name: &str) -> DeviceStats {
        let entries = self.inner.entries.read().unwrap();
        match entries.get(name) {
            Some(entry) => per_second_rates(
                &entry.previous,
                &entry.current,
                entry.previous_ts_ms,
                entry.current_ts_ms,
            ),
            None => {
                warn!(device = name, "interface not in monitor list");
                DeviceStats::default()
            }
        }
    }

    /// Elementwise sum of per-second rates across all monitored interfaces.
    #[must_use]
    pub fn delta_all(&self) -> DeviceStats {
        let entries = self.inner.entries.read().unwrap();
        entries.values().fold(DeviceStats::default(), |acc, entry| {
            acc.saturating_add(per_second_rates(
                &entry.previous,
                &entry.current,
                entry.previous_ts_ms,
                entry.current_ts_ms,
            ))
        })
    }

    /// Raise the stopping barrier, drain the tick and event tasks and drop
    /// every entry (releasing the device references).
    pub async fn cleanup(&self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.events.cancel_sync().await;
        self.inner.tick.cancel_sync().await;
        self.inner.entries.write().unwrap().clear();
        self.inner.active_count.store(0, Ordering::SeqCst);
        info!("traffic sampler cleaned up");
    }

    /// Spawn the sampling task if none is live, or wake a parked one.
    fn ensure_tick(&self) {
        let inner = Arc::clone(&self.inner);
        let spawned = self.inner.tick.spawn_if_idle(move |mut shutdown| async move {
            let mut wake = inner.wake.subscribe();
            loop {
                if inner.stopping.load(Ordering::SeqCst) {
                    break;
                }
                if inner.active_count.load(Ordering::SeqCst) == 0 {
                    // Nothing monitored: park until a registration wakes us.
                    tokio::select! {
                        _ = wake.changed() => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                tokio::select! {
                    () = tokio::time::sleep(ms(inner.sample_period_ms)) => {
                        if inner.stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.run_tick();
                    }
                    _ = wake.changed() => {}
                    _ = shutdown.changed() => break,
                }
            }
        });
        if spawned {
            debug!("traffic sampling started");
        } else {
            let _ = self.inner.wake.send(());
        }
    }
}

impl TrafficInner {
    /// Roll every entry's snapshot pair forward under the exclusive lock.
    fn run_tick(&self) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values_mut() {
            entry.previous = entry.current;
            entry.previous_ts_ms = entry.current_ts_ms;
            entry.current = entry
                .device
                .read_stats()
                .unwrap_or_else(|| entry.device.read_stats_fallback());
            entry.current_ts_ms = now;
        }
    }
}
