//! End-to-end scenarios for the state watcher under paused tokio time.
//!
//! Covers the interval contract, the hysteresis staircase, forced-state
//! override and expiry handoff, stop draining and re-entrant removal from
//! inside an action callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use radiowatch_core::clock::{Clock, MonotonicClock, ms};
use radiowatch_core::error::{Error, StopOutcome};
use radiowatch_core::watch::{StateWatcher, WatchItemSpec, WatcherConfig};

fn paused_watcher(base_period_ms: u64) -> (StateWatcher, Arc<MonotonicClock>) {
    let clock = Arc::new(MonotonicClock::new());
    let watcher = StateWatcher::with_clock(WatcherConfig { base_period_ms }, clock.clone());
    (watcher, clock)
}

/// Sampler that replays a fixed sequence, holding the last value once the
/// sequence is exhausted.
fn replay_sampler(samples: Vec<u64>) -> impl Fn() -> u64 + Send + Sync + 'static {
    let cursor = AtomicUsize::new(0);
    move || {
        let index = cursor.fetch_add(1, Ordering::SeqCst);
        samples
            .get(index)
            .copied()
            .unwrap_or_else(|| *samples.last().expect("sequence must be non-empty"))
    }
}

// =============================================================================
// Interval contract
// =============================================================================

#[tokio::test(start_paused = true)]
async fn item_interval_is_respected() {
    let (watcher, clock) = paused_watcher(100);

    let times = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let times = Arc::clone(&times);
        let clock = Arc::clone(&clock);
        move || {
            times.lock().unwrap().push(clock.now_ms());
            0
        }
    };
    watcher
        .add_item(WatchItemSpec::new(recorder).period_ms(300))
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(1_000)).await;
    watcher.stop().await;

    let times = times.lock().unwrap();
    assert_eq!(*times, vec![300, 600, 900]);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= 300, "samples closer than the period");
    }
}

#[tokio::test(start_paused = true)]
async fn items_sample_at_their_own_cadence() {
    let (watcher, _clock) = paused_watcher(100);

    let fast_count = Arc::new(AtomicU64::new(0));
    let slow_count = Arc::new(AtomicU64::new(0));

    let fast = Arc::clone(&fast_count);
    watcher
        .add_item(WatchItemSpec::new(move || {
            fast.fetch_add(1, Ordering::SeqCst);
            0
        }))
        .unwrap();

    let slow = Arc::clone(&slow_count);
    watcher
        .add_item(
            WatchItemSpec::new(move || {
                slow.fetch_add(1, Ordering::SeqCst);
                0
            })
            .period_ms(500),
        )
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(1_050)).await;
    watcher.stop().await;

    assert_eq!(fast_count.load(Ordering::SeqCst), 10);
    assert_eq!(slow_count.load(Ordering::SeqCst), 2);

    let stats = watcher.stats().unwrap();
    assert_eq!(stats.total_samples, 12);
    assert_eq!(stats.active_items, 2);
}

// =============================================================================
// Hysteresis staircase
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hysteresis_staircase_fires_expected_pairs() {
    let (watcher, _clock) = paused_watcher(100);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let id = watcher
        .add_item(
            WatchItemSpec::new(replay_sampler(vec![5, 5, 5, 5, 5, 8, 8, 5, 8, 8, 8, 8]))
                .name("staircase")
                .period_ms(100)
                .hysteresis(3)
                .action(move |old, new| sink.lock().unwrap().push((old, new))),
        )
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(1_250)).await;
    watcher.stop().await;

    // Three consecutive 5s fire (0, 5); the lone 5 at step 8 resets the
    // 8-streak, which then needs three more samples to fire (5, 8).
    assert_eq!(*fired.lock().unwrap(), vec![(0, 5), (5, 8)]);

    let stats = watcher.get_item_stats(id).unwrap();
    assert_eq!(stats.sample_count, 12);
    assert_eq!(stats.action_count, 2);
    assert_eq!(watcher.get_item_state(id).unwrap(), 8);
}

// =============================================================================
// Forced-state override
// =============================================================================

#[tokio::test(start_paused = true)]
async fn forced_override_bypasses_hysteresis_then_hands_back() {
    let (watcher, _clock) = paused_watcher(100);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&fired);
    let id = watcher
        .add_item(
            WatchItemSpec::new(|| 5)
                .name("forced")
                .period_ms(100)
                .hysteresis(3)
                .action(move |old, new| sink.lock().unwrap().push((old, new))),
        )
        .unwrap();

    watcher.start().unwrap();

    // Three consecutive 5s establish the baseline.
    tokio::time::sleep(ms(420)).await;
    assert_eq!(*fired.lock().unwrap(), vec![(0, 5)]);

    // Arm the override at t=420; it expires at t=1420.
    watcher.force_state(id, 9, 1_000).unwrap();

    // The very next due sample fires without any hysteresis delay.
    tokio::time::sleep(ms(100)).await;
    assert_eq!(*fired.lock().unwrap(), vec![(0, 5), (5, 9)]);
    assert_eq!(watcher.is_state_forced(id).unwrap(), Some(900));
    assert_eq!(watcher.get_item_state(id).unwrap(), 9);

    // While forced, the steady 9 equals the baseline: no further actions.
    // After expiry the raw 5 must pass the normal comparator again.
    tokio::time::sleep(ms(1_100)).await;
    assert_eq!(fired.lock().unwrap().len(), 2);
    assert_eq!(watcher.is_state_forced(id).unwrap(), None);

    // Third consecutive raw 5 after expiry fires (9, 5).
    tokio::time::sleep(ms(100)).await;
    watcher.stop().await;
    assert_eq!(*fired.lock().unwrap(), vec![(0, 5), (5, 9), (9, 5)]);

    // Sampling kept running (and being counted) throughout the override.
    let stats = watcher.get_item_stats(id).unwrap();
    assert_eq!(stats.sample_count, 17);
}

// =============================================================================
// Stop drains
// =============================================================================

#[tokio::test(start_paused = true)]
async fn stop_prevents_further_callbacks() {
    let (watcher, _clock) = paused_watcher(50);

    let samples = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&samples);
    watcher
        .add_item(WatchItemSpec::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        }))
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(275)).await;
    assert_eq!(watcher.stop().await, StopOutcome::Stopped);

    let at_stop = samples.load(Ordering::SeqCst);
    assert_eq!(at_stop, 5);

    tokio::time::sleep(ms(500)).await;
    assert_eq!(
        samples.load(Ordering::SeqCst),
        at_stop,
        "no sampler may run after stop returns"
    );

    // The engine restarts cleanly from the same registry.
    watcher.start().unwrap();
    tokio::time::sleep(ms(120)).await;
    watcher.stop().await;
    assert!(samples.load(Ordering::SeqCst) > at_stop);
}

// =============================================================================
// Re-entrant removal
// =============================================================================

#[tokio::test(start_paused = true)]
async fn remove_during_own_action_is_safe() {
    let (watcher, _clock) = paused_watcher(100);

    // Item A removes itself from inside its own action.
    let a_id = Arc::new(Mutex::new(None));
    let remover = {
        let watcher = watcher.clone();
        let a_id = Arc::clone(&a_id);
        move |_old: u64, _new: u64| {
            if let Some(id) = a_id.lock().unwrap().take() {
                watcher.remove_item(id).unwrap();
            }
        }
    };
    let id = watcher
        .add_item(WatchItemSpec::new(|| 1).name("self_removing").action(remover))
        .unwrap();
    *a_id.lock().unwrap() = Some(id);

    // Item B proves the engine keeps going afterwards.
    let b_samples = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&b_samples);
    watcher
        .add_item(WatchItemSpec::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        }))
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(550)).await;
    watcher.stop().await;

    assert!(matches!(
        watcher.get_item_state(id),
        Err(Error::NotFound(_))
    ));
    assert_eq!(watcher.stats().unwrap().active_items, 1);
    assert_eq!(b_samples.load(Ordering::SeqCst), 5);
    // The dispatch itself was counted even though the item is gone.
    assert_eq!(watcher.stats().unwrap().total_actions, 1);
}

// =============================================================================
// Contained callback failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn panicking_callbacks_do_not_stall_the_engine() {
    let (watcher, _clock) = paused_watcher(100);

    let bad = watcher
        .add_item(WatchItemSpec::new(|| panic!("sampler exploded")).name("bad_sampler"))
        .unwrap();

    let toggles = Arc::new(AtomicU64::new(0));
    let toggle = Arc::clone(&toggles);
    let panicking_action_id = watcher
        .add_item(
            WatchItemSpec::new(move || toggle.fetch_add(1, Ordering::SeqCst) % 2)
                .name("bad_action")
                .action(|_, _| panic!("action exploded")),
        )
        .unwrap();

    let healthy = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&healthy);
    watcher
        .add_item(WatchItemSpec::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        }))
        .unwrap();

    watcher.start().unwrap();
    tokio::time::sleep(ms(450)).await;
    watcher.stop().await;

    // All three items kept being sampled.
    assert_eq!(healthy.load(Ordering::SeqCst), 4);
    assert_eq!(watcher.get_item_stats(bad).unwrap().sample_count, 4);

    // The panicking action was dispatched repeatedly and counted.
    let stats = watcher.get_item_stats(panicking_action_id).unwrap();
    assert_eq!(stats.sample_count, 4);
    assert!(stats.action_count >= 2);
}
