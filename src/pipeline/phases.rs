//! Statistics phases

use super::Phase;
use crate::error::{FedError, FedResult};
use crate::stats::{
    merge_variance, Dispersion, GlobalSummary, Histogram, HistogramRequest, LocalSummary,
    SummaryAggregator, VarianceRequest,
};
use crate::task::{DataKind, Envelope};
use std::collections::BTreeMap;

pub const TASK_CLIENT_STATS: &str = "client_stats";
pub const TASK_AGGREGATE_VAR: &str = "aggregate_var";
pub const TASK_AGGREGATE_HISTOGRAM: &str = "aggregate_histogram";

/// Per-site summaries merged into global counts, means and bounds
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryPhase;

impl Phase for SummaryPhase {
    type Input = ();
    type Local = LocalSummary;
    type Output = GlobalSummary;

    fn name(&self) -> &'static str {
        TASK_CLIENT_STATS
    }

    fn build_input(&self, _input: &()) -> FedResult<Envelope> {
        Ok(Envelope::ok(DataKind::Analytic, Vec::new()))
    }

    fn aggregate(&self, locals: &BTreeMap<String, LocalSummary>) -> FedResult<GlobalSummary> {
        let mut aggregator = SummaryAggregator::new();
        for (site, summary) in locals {
            aggregator.add_site(site, summary.clone());
        }
        Ok(aggregator.aggregate().clone())
    }
}

/// Sum of per-site variance terms against the global mean
#[derive(Debug, Clone, Copy, Default)]
pub struct VariancePhase;

impl Phase for VariancePhase {
    type Input = GlobalSummary;
    type Local = BTreeMap<String, f64>;
    type Output = BTreeMap<String, Dispersion>;

    fn name(&self) -> &'static str {
        TASK_AGGREGATE_VAR
    }

    fn build_input(&self, summary: &GlobalSummary) -> FedResult<Envelope> {
        Envelope::encode(DataKind::Analytic, &VarianceRequest::from(summary))
    }

    fn aggregate(
        &self,
        locals: &BTreeMap<String, BTreeMap<String, f64>>,
    ) -> FedResult<BTreeMap<String, Dispersion>> {
        Ok(merge_variance(locals.values()))
    }
}

/// Bucket counts over each feature's global `[min, max]`
#[derive(Debug, Clone, Copy)]
pub struct HistogramPhase {
    bins: usize,
}

impl HistogramPhase {
    pub fn new(bins: usize) -> Self {
        Self { bins }
    }
}

impl Phase for HistogramPhase {
    type Input = GlobalSummary;
    type Local = BTreeMap<String, Histogram>;
    type Output = BTreeMap<String, Histogram>;

    fn name(&self) -> &'static str {
        TASK_AGGREGATE_HISTOGRAM
    }

    fn build_input(&self, summary: &GlobalSummary) -> FedResult<Envelope> {
        if self.bins == 0 {
            return Err(FedError::Config("histogram bin count must be > 0".to_string()));
        }
        Envelope::encode(
            DataKind::Analytic,
            &HistogramRequest::from_summary(summary, self.bins),
        )
    }

    fn aggregate(
        &self,
        locals: &BTreeMap<String, BTreeMap<String, Histogram>>,
    ) -> FedResult<BTreeMap<String, Histogram>> {
        let mut merged: BTreeMap<String, Histogram> = BTreeMap::new();
        for site in locals.values() {
            for (name, hist) in site {
                match merged.get_mut(name) {
                    Some(acc) => acc.merge(hist)?,
                    None => {
                        merged.insert(name.clone(), hist.clone());
                    }
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{FeatureSummary, HistogramSpec};

    fn local(values: &[f64]) -> LocalSummary {
        let mut summary = LocalSummary {
            rows: values.len() as u64,
            ..Default::default()
        };
        summary
            .features
            .insert("x".to_string(), FeatureSummary::from_values(values, 0));
        summary
    }

    #[test]
    fn test_summary_aggregate() {
        let locals: BTreeMap<String, LocalSummary> = [
            ("a".to_string(), local(&[1.0, 2.0])),
            ("b".to_string(), local(&[3.0, 4.0, 5.0])),
        ]
        .into_iter()
        .collect();
        let global = SummaryPhase.aggregate(&locals).unwrap();
        let x = &global.features["x"];
        assert_eq!(x.count, 5);
        assert_eq!(x.mean, 3.0);
        assert_eq!(x.min, 1.0);
        assert_eq!(x.max, 5.0);
        assert_eq!(global.rows, 5);
    }

    #[test]
    fn test_variance_aggregate() {
        // values 1..=5 split over two sites, global mean 3, N = 5
        let locals: BTreeMap<String, BTreeMap<String, f64>> = [
            ("a".to_string(), [("x".to_string(), (4.0 + 1.0) / 4.0)].into_iter().collect()),
            ("b".to_string(), [("x".to_string(), (0.0 + 1.0 + 4.0) / 4.0)].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        let out = VariancePhase.aggregate(&locals).unwrap();
        assert!((out["x"].variance - 2.5).abs() < 1e-12);
        assert!((out["x"].std_dev - 2.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_histogram_merge_and_layout_check() {
        let spec = HistogramSpec::new(2, 0.0, 2.0);
        let mut a = Histogram::new(spec);
        a.record(0.5);
        let mut b = Histogram::new(spec);
        b.record(1.5);
        b.record(1.7);
        let locals: BTreeMap<String, BTreeMap<String, Histogram>> = [
            ("a".to_string(), [("x".to_string(), a.clone())].into_iter().collect()),
            ("b".to_string(), [("x".to_string(), b)].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        let merged = HistogramPhase::new(2).aggregate(&locals).unwrap();
        assert_eq!(merged["x"].buckets(), &[1, 2]);

        let odd = Histogram::new(HistogramSpec::new(3, 0.0, 2.0));
        let locals: BTreeMap<String, BTreeMap<String, Histogram>> = [
            ("a".to_string(), [("x".to_string(), a)].into_iter().collect()),
            ("b".to_string(), [("x".to_string(), odd)].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        assert!(HistogramPhase::new(2).aggregate(&locals).is_err());
    }

    #[test]
    fn test_zero_bins_is_config_error() {
        let err = HistogramPhase::new(0)
            .build_input(&GlobalSummary::default())
            .unwrap_err();
        assert!(matches!(err, FedError::Config(_)));
    }
}
