//! Summary aggregation
//!
//! Merges per-site [`LocalSummary`] values into one [`GlobalSummary`].
//!
//! # Example
//!
//! ```
//! use fedctl::stats::{FeatureSummary, LocalSummary, SummaryAggregator};
//!
//! let mut site = LocalSummary { rows: 3, ..Default::default() };
//! site.features.insert("age".to_string(), FeatureSummary::from_values(&[1.0, 2.0, 3.0], 0));
//!
//! let mut aggregator = SummaryAggregator::new();
//! aggregator.add_site("site-1", site.clone());
//! aggregator.add_site("site-2", site);
//!
//! let global = aggregator.aggregate();
//! assert_eq!(global.rows, 6);
//! assert_eq!(global.features["age"].count, 6);
//! assert_eq!(global.features["age"].mean, 2.0);
//! ```

use crate::stats::{GlobalFeature, GlobalSummary, LocalSummary};
use std::collections::BTreeMap;

/// Aggregator for site summaries
///
/// The aggregate is cached and recomputed only after a new site is added.
#[derive(Debug, Default)]
pub struct SummaryAggregator {
    /// Per-site summaries (site → summary)
    sites: BTreeMap<String, LocalSummary>,

    aggregate_cache: Option<GlobalSummary>,
}

impl SummaryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one site's summary
    pub fn add_site(&mut self, site: &str, summary: LocalSummary) {
        self.sites.insert(site.to_string(), summary);
        self.aggregate_cache = None;
    }

    /// Global summary across all sites
    pub fn aggregate(&mut self) -> &GlobalSummary {
        let sites = &self.sites;
        self.aggregate_cache
            .get_or_insert_with(|| compute_aggregate(sites))
    }
}

fn compute_aggregate(sites: &BTreeMap<String, LocalSummary>) -> GlobalSummary {
    let mut global = GlobalSummary::default();
    // running Σ(count·mean) per feature
    let mut weighted: BTreeMap<String, f64> = BTreeMap::new();

    for (site, summary) in sites {
        global.rows += summary.rows;
        for (name, local) in &summary.features {
            let entry = global
                .features
                .entry(name.clone())
                .or_insert_with(|| GlobalFeature {
                    count: 0,
                    mean: 0.0,
                    min: f64::NAN,
                    max: f64::NAN,
                    num_zeros: 0,
                    missing: 0,
                    site_medians: BTreeMap::new(),
                });
            entry.count += local.count;
            entry.num_zeros += local.num_zeros;
            entry.missing += local.missing;
            if local.count > 0 {
                // f64::min/max ignore a NaN operand
                entry.min = entry.min.min(local.min);
                entry.max = entry.max.max(local.max);
                *weighted.entry(name.clone()).or_insert(0.0) += local.mean * local.count as f64;
            }
            if let Some(m) = local.median {
                entry.site_medians.insert(site.clone(), m);
            }
        }
    }

    for (name, feature) in global.features.iter_mut() {
        if feature.count > 0 {
            feature.mean = weighted.get(name).copied().unwrap_or(0.0) / feature.count as f64;
        }
    }
    global
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FeatureSummary;

    fn site_with(values: &[f64], missing: u64) -> LocalSummary {
        let mut s = LocalSummary {
            rows: values.len() as u64 + missing,
            ..Default::default()
        };
        s.features
            .insert("x".to_string(), FeatureSummary::from_values(values, missing));
        s
    }

    #[test]
    fn test_aggregate_empty() {
        let mut aggregator = SummaryAggregator::new();
        let global = aggregator.aggregate();
        assert_eq!(global.rows, 0);
        assert!(global.features.is_empty());
    }

    #[test]
    fn test_mean_of_repeated_values() {
        let values: Vec<f64> = (0..10).flat_map(|_| [1.0, 2.0, 3.0]).collect();
        let mut aggregator = SummaryAggregator::new();
        aggregator.add_site("a", site_with(&values[..12], 0));
        aggregator.add_site("b", site_with(&values[12..], 0));

        let global = aggregator.aggregate();
        assert_eq!(global.features["x"].count, 30);
        assert!((global.features["x"].mean - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_count_weighted_mean() {
        let mut aggregator = SummaryAggregator::new();
        aggregator.add_site("a", site_with(&[10.0], 0));
        aggregator.add_site("b", site_with(&[1.0, 1.0, 1.0], 0));
        let global = aggregator.aggregate();
        // (10 + 3) / 4, not (10 + 1) / 2
        assert_eq!(global.features["x"].mean, 3.25);
    }

    #[test]
    fn test_min_max_ignore_empty_sites() {
        let mut aggregator = SummaryAggregator::new();
        aggregator.add_site("a", site_with(&[], 4));
        aggregator.add_site("b", site_with(&[-2.0, 7.0], 1));
        let global = aggregator.aggregate();
        let x = &global.features["x"];
        assert_eq!(x.min, -2.0);
        assert_eq!(x.max, 7.0);
        assert_eq!(x.missing, 5);
        assert_eq!(global.rows, 7);
        assert_eq!(x.site_medians.len(), 1);
    }

    #[test]
    fn test_cache_invalidation() {
        let mut aggregator = SummaryAggregator::new();
        aggregator.add_site("a", site_with(&[1.0], 0));
        assert_eq!(aggregator.aggregate().features["x"].count, 1);
        aggregator.add_site("b", site_with(&[1.0, 2.0], 0));
        assert_eq!(aggregator.aggregate().features["x"].count, 3);

        // replacing a site's summary also invalidates
        aggregator.add_site("a", site_with(&[5.0, 5.0], 0));
        let global = aggregator.aggregate();
        assert_eq!(global.features["x"].count, 4);
        assert_eq!(global.features["x"].max, 5.0);
    }
}
