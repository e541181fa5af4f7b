//! radiowatch-core: periodic-observation engines for wireless-stack
//! monitoring hosts.
//!
//! Three cooperating engines share one design shape — a single periodic
//! task over a table of items, snapshot/change detection, and callback
//! dispatch with the registry lock released:
//!
//! ```text
//! StateWatcher   ──► sampler() per item ──► hysteresis ──► action(old, new)
//! Watchdog       ──► elapsed >= timeout ──► recovery()   (repeats per tick)
//! TrafficSampler ──► read_stats() per iface ──► (prev, curr) ──► rates/s
//! ```
//!
//! # Modules
//!
//! - `watch`: multi-item state sampling with per-item intervals, hysteresis
//!   and time-bounded forced-state override
//! - `watchdog`: lock-free, on-demand timeout supervisor with an adaptive
//!   tick period
//! - `traffic`: hash-indexed per-interface counter sampler with
//!   overflow-safe per-second rates
//! - `hysteresis`: the consecutive-count change filter
//! - `rate`: wrap-aware deltas and per-second normalization
//! - `clock`: monotonic millisecond time source
//! - `error`: error kinds and idempotent lifecycle outcomes
//!
//! The crate only emits `tracing` events; installing a subscriber is the
//! host's concern.  Engines spawn their tick tasks on the ambient tokio
//! runtime, so `start`/`add`/`register` must be called within one.
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod hysteresis;
pub mod rate;
mod task;
pub mod traffic;
pub mod watch;
pub mod watchdog;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{Error, Result, StartOutcome, StopOutcome};
pub use hysteresis::HysteresisFilter;
pub use traffic::{
    Device, DeviceEvent, DeviceNotification, DeviceProvider, DeviceStats, TrafficConfig,
    TrafficSampler,
};
pub use watch::{
    StateWatcher, WatchItemId, WatchItemSpec, WatchItemStats, WatcherConfig, WatcherStats,
};
pub use watchdog::{Watchdog, WatchdogItem, WatchdogStats};
