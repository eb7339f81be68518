//! Reference statistics executor
//!
//! Answers the statistics pipeline and the median protocol over a local
//! [`Dataset`]. Per-feature work runs in parallel with rayon.

use crate::controller::Signal;
use crate::error::{FedError, FedResult};
use crate::pipeline::{TASK_AGGREGATE_HISTOGRAM, TASK_AGGREGATE_VAR, TASK_CLIENT_STATS};
use crate::quantile::{
    CountRequest, CountResponse, MedianAction, PartitionCounts, PurgeRequest, PurgeResponse,
    SampleRequest, SampleResponse, WorkingSet, TASK_DATA_PURGE, TASK_RANDOM_SELECT,
    TASK_SIZE_COLLECTION,
};
use crate::site::{Dataset, SiteExecutor};
use crate::stats::{FeatureSummary, Histogram, HistogramRequest, LocalSummary, VarianceRequest};
use crate::task::{DataKind, Envelope, ReturnCode};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Executor over one site's table
#[derive(Debug)]
pub struct StatsExecutor {
    dataset: Dataset,
    working: WorkingSet,
    rng: Xoshiro256PlusPlus,
}

impl StatsExecutor {
    pub fn new(dataset: Dataset, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::seed_from_u64(rand::random()),
        };
        Self {
            dataset,
            working: WorkingSet::default(),
            rng,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Summary of one feature, `None` if the site has no such column
    pub fn local_summary(&self, feature: &str) -> Option<FeatureSummary> {
        self.dataset
            .column(feature)
            .map(|c| FeatureSummary::from_values(&c.values, c.missing))
    }

    /// Summaries of every numeric column
    pub fn local_summaries(&self) -> LocalSummary {
        let features = self
            .dataset
            .columns()
            .par_iter()
            .map(|(name, c)| (name.clone(), FeatureSummary::from_values(&c.values, c.missing)))
            .collect();
        LocalSummary {
            rows: self.dataset.rows(),
            features,
        }
    }

    /// Per-feature `Σ(x − mean)² / (N − 1)` against the global mean and count
    pub fn local_variance(&self, request: &VarianceRequest) -> BTreeMap<String, f64> {
        request
            .means
            .par_iter()
            .filter_map(|(name, mean)| {
                let column = self.dataset.column(name)?;
                let count = request.counts.get(name).copied().unwrap_or(0);
                let term = if count < 2 {
                    0.0
                } else {
                    let ss: f64 = column.values.iter().map(|x| (x - mean).powi(2)).sum();
                    ss / (count - 1) as f64
                };
                Some((name.clone(), term))
            })
            .collect()
    }

    /// Histograms over the global layout
    pub fn local_histograms(&self, request: &HistogramRequest) -> FedResult<BTreeMap<String, Histogram>> {
        request
            .specs
            .par_iter()
            .filter_map(|(name, spec)| {
                let column = self.dataset.column(name)?;
                if spec.bins == 0 {
                    return Some(Err(FedError::phase(
                        TASK_AGGREGATE_HISTOGRAM,
                        format!("zero bins requested for '{}'", name),
                    )));
                }
                let mut hist = Histogram::new(*spec);
                for &v in &column.values {
                    hist.record(v);
                }
                Some(Ok((name.clone(), hist)))
            })
            .collect()
    }

    /// Start the median protocol over a fresh copy of the data
    pub fn reset_working_set(&mut self) {
        self.working = WorkingSet::new(self.dataset.value_map());
    }

    /// One uniformly chosen value from the remaining working set
    pub fn local_sample(&mut self, feature: &str) -> Option<f64> {
        let values = self.working.values(feature)?;
        if values.is_empty() {
            return None;
        }
        Some(values[self.rng.gen_range(0..values.len())])
    }

    pub fn local_partition_counts(&self, feature: &str, pivot: f64) -> PartitionCounts {
        self.working
            .values(feature)
            .map(|v| PartitionCounts::of(v, pivot))
            .unwrap_or_default()
    }

    /// Drop the disqualified partition; returns the remaining count
    pub fn local_purge(&mut self, feature: &str, action: MedianAction, pivot: f64) -> u64 {
        self.working.purge(feature, action, pivot)
    }

    /// Run a known task; `Ok(None)` for unknown task names
    fn run(&mut self, task_name: &str, payload: &Envelope) -> FedResult<Option<Envelope>> {
        let round = payload.round.unwrap_or(0);
        let env = match task_name {
            TASK_CLIENT_STATS => Envelope::encode(DataKind::Analytic, &self.local_summaries())?,
            TASK_AGGREGATE_VAR => {
                let request: VarianceRequest = payload.decode()?;
                Envelope::encode(DataKind::Analytic, &self.local_variance(&request))?
            }
            TASK_AGGREGATE_HISTOGRAM => {
                let request: HistogramRequest = payload.decode()?;
                Envelope::encode(DataKind::Analytic, &self.local_histograms(&request)?)?
            }
            TASK_RANDOM_SELECT => {
                let request: SampleRequest = payload.decode()?;
                let pivots = request
                    .features
                    .iter()
                    .filter_map(|f| self.local_sample(f).map(|p| (f.clone(), p)))
                    .collect();
                Envelope::encode(DataKind::Analytic, &SampleResponse { round, pivots })?
            }
            TASK_SIZE_COLLECTION => {
                let request: CountRequest = payload.decode()?;
                if request.round == 1 {
                    self.reset_working_set();
                }
                let counts = request
                    .pivots
                    .iter()
                    .map(|(f, p)| (f.clone(), self.local_partition_counts(f, *p)))
                    .collect();
                Envelope::encode(DataKind::Analytic, &CountResponse { round, counts })?
            }
            TASK_DATA_PURGE => {
                let request: PurgeRequest = payload.decode()?;
                let remaining = request
                    .actions
                    .iter()
                    .map(|(f, (action, pivot))| (f.clone(), self.local_purge(f, *action, *pivot)))
                    .collect();
                Envelope::encode(DataKind::Analytic, &PurgeResponse { round, remaining })?
            }
            _ => return Ok(None),
        };
        Ok(Some(env))
    }
}

impl SiteExecutor for StatsExecutor {
    fn execute(&mut self, task_name: &str, payload: &Envelope, abort: &Signal) -> Envelope {
        if abort.triggered() {
            return Envelope::reply(ReturnCode::TaskAborted);
        }
        let reply = match self.run(task_name, payload) {
            Ok(Some(env)) => env,
            Ok(None) => {
                warn!(task = task_name, "unknown task");
                Envelope::reply(ReturnCode::TaskUnknown)
            }
            Err(FedError::Codec(e)) => {
                warn!(task = task_name, error = %e, "bad task data");
                Envelope::reply(ReturnCode::BadTaskData)
            }
            Err(e) => {
                warn!(task = task_name, error = %e, "task failed");
                Envelope::reply(ReturnCode::ExecutionException)
            }
        };
        if abort.triggered() {
            return Envelope::reply(ReturnCode::TaskAborted);
        }
        debug!(task = task_name, code = %reply.return_code, "task executed");
        match payload.round {
            Some(r) => reply.with_round(r),
            None => reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::HistogramSpec;

    fn executor() -> StatsExecutor {
        let ds = Dataset::parse_csv("x,y\n1,0\n2,?\n3,5\n4,5\n").unwrap();
        StatsExecutor::new(ds, Some(1))
    }

    fn run(ex: &mut StatsExecutor, name: &str, payload: Envelope) -> Envelope {
        ex.execute(name, &payload, &Signal::new())
    }

    #[test]
    fn test_client_stats() {
        let mut ex = executor();
        let env = run(&mut ex, TASK_CLIENT_STATS, Envelope::reply(ReturnCode::Ok));
        assert!(env.is_ok());
        let summary: LocalSummary = env.decode().unwrap();
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.features["x"].mean, 2.5);
        assert_eq!(summary.features["y"].missing, 1);
        assert_eq!(summary.features["y"].num_zeros, 1);
    }

    #[test]
    fn test_variance_term_uses_global_count() {
        let ex = executor();
        let request = VarianceRequest {
            means: [("x".to_string(), 2.5)].into_iter().collect(),
            counts: [("x".to_string(), 5)].into_iter().collect(),
        };
        let terms = ex.local_variance(&request);
        // (2.25 + 0.25 + 0.25 + 2.25) / 4
        assert_eq!(terms["x"], 1.25);
    }

    #[test]
    fn test_histogram_task() {
        let mut ex = executor();
        let request = HistogramRequest {
            specs: [("x".to_string(), HistogramSpec::new(2, 1.0, 4.0))].into_iter().collect(),
        };
        let env = run(
            &mut ex,
            TASK_AGGREGATE_HISTOGRAM,
            Envelope::encode(DataKind::Analytic, &request).unwrap(),
        );
        let hists: BTreeMap<String, Histogram> = env.decode().unwrap();
        assert_eq!(hists["x"].buckets(), &[2, 2]);
    }

    #[test]
    fn test_error_codes() {
        let mut ex = executor();
        let env = run(&mut ex, "train", Envelope::reply(ReturnCode::Ok));
        assert_eq!(env.return_code, ReturnCode::TaskUnknown);

        let garbage = Envelope::ok(DataKind::Analytic, vec![0xff]);
        let env = run(&mut ex, TASK_AGGREGATE_VAR, garbage);
        assert_eq!(env.return_code, ReturnCode::BadTaskData);

        let request = HistogramRequest {
            specs: [("x".to_string(), HistogramSpec::new(0, 1.0, 4.0))].into_iter().collect(),
        };
        let env = run(
            &mut ex,
            TASK_AGGREGATE_HISTOGRAM,
            Envelope::encode(DataKind::Analytic, &request).unwrap(),
        );
        assert_eq!(env.return_code, ReturnCode::ExecutionException);

        let abort = Signal::new();
        abort.trigger();
        let env = ex.execute(TASK_CLIENT_STATS, &Envelope::reply(ReturnCode::Ok), &abort);
        assert_eq!(env.return_code, ReturnCode::TaskAborted);
    }

    #[test]
    fn test_quantile_tasks_echo_round() {
        let mut ex = executor();
        let request = CountRequest {
            round: 1,
            pivots: [("x".to_string(), 2.0)].into_iter().collect(),
        };
        let env = run(
            &mut ex,
            TASK_SIZE_COLLECTION,
            Envelope::encode(DataKind::Analytic, &request).unwrap().with_round(1),
        );
        assert_eq!(env.round, Some(1));
        let resp: CountResponse = env.decode().unwrap();
        assert_eq!(resp.counts["x"], PartitionCounts { greater: 2, equal: 1, less: 1 });

        assert_eq!(ex.local_purge("x", MedianAction::DiscardLess, 2.0), 2);
        let sample = ex.local_sample("x").unwrap();
        assert!(sample == 3.0 || sample == 4.0);
        assert_eq!(ex.local_sample("missing"), None);
    }
}
