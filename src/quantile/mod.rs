//! Distributed quantile estimation
//!
//! Approximates the global median of every numeric feature without any site
//! revealing values beyond one sampled pivot per round and partition counts.
//!
//! # Rounds
//!
//! ```text
//! round 1:   pivot = local median of one site (known from the summary phase)
//! round ≥2:  pivot = one value sampled by one randomly chosen site
//! each:      size collection (m, e, l) → decision → purge
//! ```
//!
//! The rank convention counts from the top: the target is the k-th largest
//! value with `k = ⌈N/2⌉`. Sites only count their *remaining* working set, so
//! [`QuantileRoundState`] keeps the cumulative number of discarded values on
//! each side. The two early-stop rules look at the global picture (round counts
//! plus discarded counts); the rank rule uses the round-local `k`.
//!
//! Every request and response carries the round number. Responses that belong
//! to another round, or that do not cover exactly the requested features, are
//! rejected. A site that does not acknowledge a purge is dropped from every
//! later round, since its working set no longer matches the others.

pub mod protocol;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use protocol::{QuantileOutcome, QuantileProtocol};

/// Task names used by the protocol
pub const TASK_AGGREGATE_MEDIAN: &str = "aggregate_median";
pub const TASK_RANDOM_SELECT: &str = "aggregate_median:random_select";
pub const TASK_SIZE_COLLECTION: &str = "aggregate_median:size_collection";
pub const TASK_DATA_PURGE: &str = "aggregate_median:data_purge";

/// Tolerance of the "pivot splits the data in half" stop rule
const BALANCE_TOLERANCE: f64 = 0.005;

/// Per-feature decision after a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MedianAction {
    /// Not decided yet
    Continue,
    /// Drop values ≥ pivot; the target lies below
    DiscardGreater,
    /// Drop values ≤ pivot; the target lies above
    DiscardLess,
    Stop,
}

impl MedianAction {
    /// Flag value on the wire of the control channel
    pub fn flag(self) -> u8 {
        match self {
            MedianAction::DiscardGreater => 1,
            MedianAction::DiscardLess => 2,
            MedianAction::Stop => 4,
            MedianAction::Continue => 16,
        }
    }

    pub fn is_discard(self) -> bool {
        matches!(self, MedianAction::DiscardGreater | MedianAction::DiscardLess)
    }

    /// Whether a working-set value survives this action
    #[inline]
    pub fn keeps(self, value: f64, pivot: f64) -> bool {
        match self {
            MedianAction::DiscardGreater => value < pivot,
            MedianAction::DiscardLess => value > pivot,
            MedianAction::Continue | MedianAction::Stop => true,
        }
    }
}

impl fmt::Display for MedianAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MedianAction::Continue => "CONTINUE",
            MedianAction::DiscardGreater => "DISCARD_GREATER",
            MedianAction::DiscardLess => "DISCARD_LESS",
            MedianAction::Stop => "STOP",
        };
        f.write_str(s)
    }
}

/// Counts of values greater than, equal to and less than a pivot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts {
    pub greater: u64,
    pub equal: u64,
    pub less: u64,
}

impl PartitionCounts {
    /// Count one site's working set against a pivot
    pub fn of(values: &[f64], pivot: f64) -> Self {
        let mut counts = Self::default();
        for &v in values {
            if v > pivot {
                counts.greater += 1;
            } else if v < pivot {
                counts.less += 1;
            } else {
                counts.equal += 1;
            }
        }
        counts
    }

    pub fn add(&mut self, other: &PartitionCounts) {
        self.greater += other.greater;
        self.equal += other.equal;
        self.less += other.less;
    }

    pub fn total(&self) -> u64 {
        self.greater + self.equal + self.less
    }
}

/// Protocol state of one feature, carried across rounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileRoundState {
    /// Target rank within the remaining values, counted from the top
    pub k: u64,
    pub pivot: Option<f64>,
    /// Triple of the last decided round (remaining values only)
    pub counts: PartitionCounts,
    pub discarded_greater: u64,
    pub discarded_less: u64,
    pub action: MedianAction,
    /// Round the current action was derived from
    pub round: u32,
}

impl QuantileRoundState {
    /// Fresh state for a feature with `total` non-missing values
    pub fn new(total: u64) -> Self {
        Self {
            k: total.div_ceil(2),
            pivot: None,
            counts: PartitionCounts::default(),
            discarded_greater: 0,
            discarded_less: 0,
            action: MedianAction::Continue,
            round: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.action == MedianAction::Stop
    }

    /// Apply the decision rule to one round's aggregated triple
    ///
    /// `pivot` is the pivot that produced `counts` in `round`; both become the
    /// state's current pivot and triple.
    pub fn decide(&mut self, round: u32, pivot: f64, counts: PartitionCounts) -> MedianAction {
        self.round = round;
        self.pivot = Some(pivot);
        self.counts = counts;

        let m = counts.greater + self.discarded_greater;
        let l = counts.less + self.discarded_less;
        let e = counts.equal;
        let total = m + e + l;

        self.action = if total == 0 || counts.total() == 0 {
            MedianAction::Stop
        } else if e >= m.abs_diff(l) {
            MedianAction::Stop
        } else if (m as f64 / total as f64 - 0.5).abs() < BALANCE_TOLERANCE
            || (l as f64 / total as f64 - 0.5).abs() < BALANCE_TOLERANCE
        {
            MedianAction::Stop
        } else if counts.greater >= self.k {
            // rank-k value is above the pivot
            self.discarded_less += counts.equal + counts.less;
            MedianAction::DiscardLess
        } else if counts.greater + counts.equal >= self.k {
            // the pivot itself is the rank-k value
            MedianAction::Stop
        } else {
            let dropped = counts.greater + counts.equal;
            self.discarded_greater += dropped;
            self.k -= dropped;
            MedianAction::DiscardGreater
        };
        self.action
    }

    /// Stop without a new round (round cap or no values left to sample)
    pub fn force_stop(&mut self) {
        self.action = MedianAction::Stop;
    }
}

/// Round ≥2 pivot request for one site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub round: u32,
    pub features: Vec<String>,
}

/// Sampled pivots; features with an empty working set are omitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResponse {
    pub round: u32,
    pub pivots: BTreeMap<String, f64>,
}

/// Size-collection request; round 1 also resets the site's working sets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRequest {
    pub round: u32,
    pub pivots: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub round: u32,
    pub counts: BTreeMap<String, PartitionCounts>,
}

/// Purge request: `(action, pivot)` per feature to shrink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub round: u32,
    pub actions: BTreeMap<String, (MedianAction, f64)>,
}

/// Remaining working-set size per feature after the purge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub round: u32,
    pub remaining: BTreeMap<String, u64>,
}

/// Site-side working sets for the protocol
///
/// Holds a copy of every feature's values; purges shrink the copies, never
/// the underlying data.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    features: BTreeMap<String, Vec<f64>>,
}

impl WorkingSet {
    pub fn new(features: BTreeMap<String, Vec<f64>>) -> Self {
        Self { features }
    }

    pub fn values(&self, feature: &str) -> Option<&[f64]> {
        self.features.get(feature).map(Vec::as_slice)
    }

    pub fn remaining(&self, feature: &str) -> u64 {
        self.features.get(feature).map(|v| v.len() as u64).unwrap_or(0)
    }

    /// Drop the disqualified partition of one feature
    pub fn purge(&mut self, feature: &str, action: MedianAction, pivot: f64) -> u64 {
        match self.features.get_mut(feature) {
            Some(values) => {
                values.retain(|&v| action.keeps(v, pivot));
                values.len() as u64
            }
            None => 0,
        }
    }
}
