//! Equal-width histogram
//!
//! A fixed-layout histogram over a closed range `[low, high]`. Every site
//! builds its histogram with the same layout (bin count and range come from the
//! global min/max of the first phase), so merging is a bucket-wise sum.
//!
//! Values outside the range are clamped into the first/last bucket. NaN values
//! are counted separately.

use crate::error::{FedError, FedResult};
use serde::{Deserialize, Serialize};

/// Histogram layout handed to sites
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramSpec {
    pub bins: usize,
    pub low: f64,
    pub high: f64,
}

impl HistogramSpec {
    pub fn new(bins: usize, low: f64, high: f64) -> Self {
        Self { bins, low, high }
    }

    /// Bucket index for a finite value
    #[inline]
    pub fn bucket_of(&self, value: f64) -> usize {
        if self.bins <= 1 || self.high <= self.low {
            return 0;
        }
        let width = (self.high - self.low) / self.bins as f64;
        let idx = ((value - self.low) / width).floor();
        if idx < 0.0 {
            0
        } else {
            (idx as usize).min(self.bins - 1)
        }
    }

    /// `(low, high)` bounds of bucket `idx`
    pub fn bounds(&self, idx: usize) -> (f64, f64) {
        let width = if self.bins == 0 {
            0.0
        } else {
            (self.high - self.low) / self.bins as f64
        };
        let lo = self.low + width * idx as f64;
        let hi = if idx + 1 == self.bins {
            self.high
        } else {
            self.low + width * (idx + 1) as f64
        };
        (lo, hi)
    }
}

/// Bucket counts for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    spec: HistogramSpec,
    buckets: Vec<u64>,
    num_nan: u64,
}

impl Histogram {
    pub fn new(spec: HistogramSpec) -> Self {
        Self {
            buckets: vec![0; spec.bins.max(1)],
            spec,
            num_nan: 0,
        }
    }

    /// Record one value
    #[inline]
    pub fn record(&mut self, value: f64) {
        if value.is_nan() {
            self.num_nan += 1;
            return;
        }
        let idx = self.spec.bucket_of(value);
        self.buckets[idx] += 1;
    }

    /// Add another histogram's counts into this one
    ///
    /// Fails when the layouts differ.
    pub fn merge(&mut self, other: &Histogram) -> FedResult<()> {
        if self.spec != other.spec || self.buckets.len() != other.buckets.len() {
            return Err(FedError::phase(
                "aggregate_histogram",
                format!(
                    "bucket layout mismatch: {:?} vs {:?}",
                    self.spec, other.spec
                ),
            ));
        }
        for (mine, theirs) in self.buckets.iter_mut().zip(&other.buckets) {
            *mine += theirs;
        }
        self.num_nan += other.num_nan;
        Ok(())
    }

    pub fn spec(&self) -> &HistogramSpec {
        &self.spec
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn num_nan(&self) -> u64 {
        self.num_nan
    }

    /// Total number of recorded finite values
    pub fn len(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.num_nan == 0
    }

    /// `((low, high), count)` per bucket
    pub fn ranges(&self) -> Vec<((f64, f64), u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, &count)| (self.spec.bounds(i), count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_basic() {
        let mut hist = Histogram::new(HistogramSpec::new(4, 0.0, 8.0));
        assert!(hist.is_empty());
        for v in [0.0, 1.9, 2.0, 7.99, 8.0, f64::NAN] {
            hist.record(v);
        }
        assert_eq!(hist.buckets(), &[2, 1, 0, 2]);
        assert_eq!(hist.num_nan(), 1);
        assert_eq!(hist.len(), 5);
    }

    #[test]
    fn test_histogram_clamps_out_of_range() {
        let mut hist = Histogram::new(HistogramSpec::new(2, 0.0, 10.0));
        hist.record(-5.0);
        hist.record(50.0);
        assert_eq!(hist.buckets(), &[1, 1]);
    }

    #[test]
    fn test_histogram_merge() {
        let spec = HistogramSpec::new(2, 0.0, 10.0);
        let mut a = Histogram::new(spec);
        let mut b = Histogram::new(spec);
        a.record(1.0);
        b.record(1.0);
        b.record(9.0);
        b.record(f64::NAN);
        a.merge(&b).unwrap();
        assert_eq!(a.buckets(), &[2, 1]);
        assert_eq!(a.num_nan(), 1);
    }

    #[test]
    fn test_histogram_merge_rejects_layout_mismatch() {
        let mut a = Histogram::new(HistogramSpec::new(2, 0.0, 10.0));
        let b = Histogram::new(HistogramSpec::new(3, 0.0, 10.0));
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_bounds_cover_range() {
        let spec = HistogramSpec::new(4, 0.0, 1.0);
        assert_eq!(spec.bounds(0), (0.0, 0.25));
        assert_eq!(spec.bounds(3), (0.75, 1.0));
    }

    #[test]
    fn test_degenerate_range_uses_first_bucket() {
        let mut hist = Histogram::new(HistogramSpec::new(3, 5.0, 5.0));
        hist.record(5.0);
        assert_eq!(hist.buckets(), &[1, 0, 0]);
    }
}
