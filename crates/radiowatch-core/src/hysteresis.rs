//! Consecutive-count hysteresis filter for state-change detection.
//!
//! The filter decides whether an observed state value represents a real
//! transition away from a baseline (the state at which the last action
//! fired) or transient flapping.  A candidate value must be observed for
//! `threshold` consecutive samples before the filter fires; any excursion
//! back to the baseline, or to a different candidate, restarts the count.
//!
//! ```text
//! baseline = 5, threshold = 3
//!
//! sample:   5  8  8  5  8  8  8
//! count:    0  1  2  0  1  2  3  ──► fire (5 → 8)
//! ```
//!
//! A threshold of zero disables filtering: any inequality with the baseline
//! fires immediately and the scratch state is left untouched.

/// Hysteresis comparator over raw sample values.
///
/// Holds the candidate/consecutive scratch for one monitored signal.  The
/// baseline is supplied by the caller on every observation because it is
/// owned by the engine (it only advances when an action is dispatched).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HysteresisFilter {
    threshold: u64,
    candidate: u64,
    consecutive: u64,
}

impl HysteresisFilter {
    /// Create a filter with the given consecutive-count threshold.
    #[must_use]
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            candidate: 0,
            consecutive: 0,
        }
    }

    /// Feed one observation and decide whether the change should fire.
    ///
    /// Rules, evaluated in order:
    /// 1. `threshold == 0`: fire iff `new_state != baseline`; scratch untouched.
    /// 2. `new_state == baseline`: reset the scratch, never fire.
    /// 3. `new_state == candidate`: bump the count; fire (and reset the
    ///    count) once it reaches the threshold.
    /// 4. Otherwise: adopt `new_state` as the candidate with count 1.
    pub fn observe(&mut self, baseline: u64, new_state: u64) -> bool {
        if self.threshold == 0 {
            return baseline != new_state;
        }

        if new_state == baseline {
            self.consecutive = 0;
            self.candidate = new_state;
            return false;
        }

        if new_state == self.candidate {
            self.consecutive += 1;
            if self.consecutive >= self.threshold {
                self.consecutive = 0;
                return true;
            }
            return false;
        }

        self.candidate = new_state;
        self.consecutive = 1;
        false
    }

    /// The configured consecutive-count threshold.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Current candidate state under evaluation.
    #[must_use]
    pub fn candidate(&self) -> u64 {
        self.candidate
    }

    /// Consecutive occurrences of the current candidate.
    ///
    /// Never exceeds the threshold: the count resets to zero on firing.
    #[must_use]
    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }
}
