//! Statistics value types
//!
//! Local summaries produced by sites and the global aggregates built from them.
//! Feature maps are `BTreeMap`s keyed by feature name so that every site and
//! the server iterate features in the same order.
//!
//! # Merge Rules
//!
//! - counts, zeros and missing values are summed
//! - the global mean is the count-weighted mean of the local means
//! - min/max take the extremes
//! - per-site variance terms `Σ(x−mean)²/(N−1)` are summed to the global
//!   sample variance
//! - histograms are summed bucket-wise (see [`histogram`])

pub mod aggregator;
pub mod histogram;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use aggregator::SummaryAggregator;
pub use histogram::{Histogram, HistogramSpec};

/// One site's summary of one numeric feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    /// Non-missing values
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub num_zeros: u64,
    pub missing: u64,
    /// Local median, `None` when the site has no values
    pub median: Option<f64>,
}

impl FeatureSummary {
    /// Summarise a slice of values; `missing` is passed through
    pub fn from_values(values: &[f64], missing: u64) -> Self {
        let count = values.len() as u64;
        if values.is_empty() {
            return Self {
                count: 0,
                mean: 0.0,
                min: f64::NAN,
                max: f64::NAN,
                num_zeros: 0,
                missing,
                median: None,
            };
        }
        let sum: f64 = values.iter().sum();
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let num_zeros = values.iter().filter(|v| **v == 0.0).count() as u64;
        Self {
            count,
            mean: sum / count as f64,
            min,
            max,
            num_zeros,
            missing,
            median: median(values),
        }
    }
}

/// Median of unsorted values (mean of the two middle values for even length)
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// One site's answer to the summary phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSummary {
    /// Rows in the site's table
    pub rows: u64,
    pub features: BTreeMap<String, FeatureSummary>,
}

/// Global view of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalFeature {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub num_zeros: u64,
    pub missing: u64,
    /// Local medians keyed by site, used to seed the first quantile round
    pub site_medians: BTreeMap<String, f64>,
}

/// Aggregate of the summary phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub rows: u64,
    pub features: BTreeMap<String, GlobalFeature>,
}

impl GlobalSummary {
    pub fn feature_names(&self) -> Vec<String> {
        self.features.keys().cloned().collect()
    }
}

/// Payload of the variance phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarianceRequest {
    pub means: BTreeMap<String, f64>,
    pub counts: BTreeMap<String, u64>,
}

impl From<&GlobalSummary> for VarianceRequest {
    fn from(summary: &GlobalSummary) -> Self {
        let mut request = VarianceRequest::default();
        for (name, f) in &summary.features {
            request.means.insert(name.clone(), f.mean);
            request.counts.insert(name.clone(), f.count);
        }
        request
    }
}

/// Global variance and standard deviation of one feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dispersion {
    pub variance: f64,
    pub std_dev: f64,
}

/// Sum per-site variance terms into global variance and std dev
pub fn merge_variance<'a, I>(terms: I) -> BTreeMap<String, Dispersion>
where
    I: IntoIterator<Item = &'a BTreeMap<String, f64>>,
{
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    for site in terms {
        for (name, term) in site {
            *sums.entry(name.clone()).or_insert(0.0) += term;
        }
    }
    sums.into_iter()
        .map(|(name, variance)| {
            (
                name,
                Dispersion {
                    variance,
                    std_dev: variance.sqrt(),
                },
            )
        })
        .collect()
}

/// Payload of the histogram phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramRequest {
    pub specs: BTreeMap<String, HistogramSpec>,
}

impl HistogramRequest {
    /// Same bin count for every feature over its global `[min, max]`
    pub fn from_summary(summary: &GlobalSummary, bins: usize) -> Self {
        let specs = summary
            .features
            .iter()
            .filter(|(_, f)| f.count > 0)
            .map(|(name, f)| (name.clone(), HistogramSpec::new(bins, f.min, f.max)))
            .collect();
        Self { specs }
    }
}
