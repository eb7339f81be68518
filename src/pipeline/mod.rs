//! Aggregation pipeline
//!
//! A phase is one schedule + wait + aggregate cycle. [`PhaseRunner`] runs any
//! [`Phase`] on a [`Controller`]; [`StatsPipeline`] chains the statistics
//! phases and the median protocol into one strictly sequential run.
//!
//! # Pipeline
//!
//! ```text
//! wait for sites
//!   → client_stats        (summary per site → global counts, means, min/max)
//!   → aggregate_var       (payload: global means/counts)
//!   → aggregate_median    (multi-round quantile protocol)
//!   → aggregate_histogram (payload: global min/max, bin count)
//!   → GlobalStats
//! ```
//!
//! Any failed phase aborts the rest of the run; no partial result is returned.
//! Sites reporting a non-OK code are dropped from that phase's aggregate.

pub mod phases;

use crate::config::{PipelineConfig, QuantileConfig};
use crate::controller::{callback, lock, Controller};
use crate::dispatch::{Broadcast, DispatchStrategy};
use crate::error::{FedError, FedResult};
use crate::quantile::{QuantileOutcome, QuantileProtocol, TASK_AGGREGATE_MEDIAN};
use crate::stats::{Dispersion, GlobalSummary, Histogram, LocalSummary};
use crate::task::{Envelope, ReturnCode, Task};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub use phases::{
    HistogramPhase, SummaryPhase, VariancePhase, TASK_AGGREGATE_HISTOGRAM, TASK_AGGREGATE_VAR,
    TASK_CLIENT_STATS,
};

/// How a phase is dispatched
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSpec {
    pub targets: Option<Vec<String>>,
    pub min_responses: usize,
    pub grace: Duration,
    pub timeout: Duration,
}

/// One schedule + wait + aggregate cycle
pub trait Phase {
    /// Aggregate of an earlier phase this phase's payload is built from
    type Input;
    /// Decoded result of one site
    type Local: DeserializeOwned + Send + 'static;
    type Output;

    /// Task name sent to the sites
    fn name(&self) -> &'static str;

    fn strategy(&self) -> Box<dyn DispatchStrategy> {
        Box::new(Broadcast::new())
    }

    fn build_input(&self, input: &Self::Input) -> FedResult<Envelope>;

    fn aggregate(&self, locals: &BTreeMap<String, Self::Local>) -> FedResult<Self::Output>;
}

/// Accumulated results of one phase
#[derive(Debug, Clone)]
pub struct PhaseState<L> {
    pub results: BTreeMap<String, L>,
    pub failures: Vec<(String, ReturnCode)>,
    /// Results that arrived OK but could not be decoded
    pub rejected: Vec<(String, String)>,
    pub completion: ReturnCode,
}

impl<L> Default for PhaseState<L> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
            failures: Vec::new(),
            rejected: Vec::new(),
            completion: ReturnCode::Ok,
        }
    }
}

/// Aggregate plus the state it was built from
#[derive(Debug, Clone)]
pub struct PhaseOutcome<L, O> {
    pub output: O,
    pub state: PhaseState<L>,
}

impl<L, O> PhaseOutcome<L, O> {
    /// Sites whose result made it into the aggregate
    pub fn contributors(&self) -> Vec<String> {
        self.state.results.keys().cloned().collect()
    }
}

/// Runs phases on a controller
pub struct PhaseRunner<'a> {
    controller: &'a Controller,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(controller: &'a Controller) -> Self {
        Self { controller }
    }

    /// Schedule the phase, wait for it and aggregate the OK results
    pub fn run<P: Phase>(
        &self,
        phase: &P,
        input: &P::Input,
        dispatch: &DispatchSpec,
    ) -> FedResult<PhaseOutcome<P::Local, P::Output>> {
        let name = phase.name();
        let payload = phase.build_input(input)?;
        let task = Task::new(name, payload)
            .with_min_responses(dispatch.min_responses)
            .with_grace(dispatch.grace)
            .with_timeout(dispatch.timeout);

        let state: Arc<Mutex<PhaseState<P::Local>>> = Arc::new(Mutex::new(PhaseState::default()));
        let sink = state.clone();
        let on_result = callback(move |r| {
            if !r.envelope.is_ok() {
                return Ok(None);
            }
            match r.envelope.decode::<P::Local>() {
                Ok(local) => {
                    lock(&sink).results.insert(r.client.to_string(), local);
                    Ok(None)
                }
                Err(e) => {
                    error!(phase = r.task_name, client = r.client, error = %e, "undecodable result");
                    lock(&sink)
                        .rejected
                        .push((r.client.to_string(), e.to_string()));
                    Err(e)
                }
            }
        });

        info!(phase = name, targets = ?dispatch.targets, "phase started");
        let started = Instant::now();
        let id = self.controller.schedule(
            task,
            phase.strategy(),
            dispatch.targets.clone(),
            Some(on_result),
        )?;
        let outcome = self.controller.wait(id)?;

        let mut state = std::mem::take(&mut *lock(&state));
        for (client, code) in outcome.failures() {
            let err = FedError::client_result(client.as_str(), name, code);
            warn!(phase = name, error = %err, "site dropped from aggregate");
            state.failures.push((client, code));
        }
        if state.results.is_empty() {
            state.completion = ReturnCode::Error;
            return Err(FedError::phase(
                name,
                format!(
                    "no usable results ({} failed, {} rejected, timed out: {})",
                    state.failures.len(),
                    state.rejected.len(),
                    outcome.timed_out
                ),
            ));
        }

        let output = phase.aggregate(&state.results)?;
        info!(
            phase = name,
            sites = state.results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "phase complete"
        );
        Ok(PhaseOutcome { output, state })
    }
}

/// Everything the pipeline publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub created_at: DateTime<Utc>,
    pub sites: Vec<String>,
    pub summary: GlobalSummary,
    pub per_site: BTreeMap<String, LocalSummary>,
    pub dispersion: BTreeMap<String, Dispersion>,
    pub medians: BTreeMap<String, Option<f64>>,
    pub median_rounds: u32,
    pub median_converged: bool,
    pub histograms: BTreeMap<String, Histogram>,
    /// Sites dropped from some phase: (site, phase, code)
    pub dropped: Vec<(String, String, ReturnCode)>,
}

fn note_dropped(
    dropped: &mut Vec<(String, String, ReturnCode)>,
    phase: &str,
    failures: &[(String, ReturnCode)],
) {
    for (site, code) in failures {
        dropped.push((site.clone(), phase.to_string(), *code));
    }
}

/// Statistics pipeline orchestrator
pub struct StatsPipeline<'a> {
    controller: &'a Controller,
    pipeline: &'a PipelineConfig,
    quantile: &'a QuantileConfig,
}

impl<'a> StatsPipeline<'a> {
    pub fn new(
        controller: &'a Controller,
        pipeline: &'a PipelineConfig,
        quantile: &'a QuantileConfig,
    ) -> Self {
        Self {
            controller,
            pipeline,
            quantile,
        }
    }

    /// Block until `min_sites` sites have registered
    pub fn wait_for_sites(&self) -> FedResult<Vec<String>> {
        let deadline = self.pipeline.site_wait_timeout();
        let started = Instant::now();
        let abort = self.controller.abort_signal();
        loop {
            let known = self.controller.known_clients();
            if known.len() >= self.pipeline.min_sites.max(1) {
                info!(sites = known.len(), "enough sites registered");
                return Ok(known);
            }
            if abort.triggered() {
                return Err(FedError::TaskAborted {
                    task: "wait_for_sites".to_string(),
                });
            }
            if !deadline.is_zero() && started.elapsed() >= deadline {
                return Err(FedError::phase(
                    "wait_for_sites",
                    format!(
                        "only {} of {} sites registered",
                        known.len(),
                        self.pipeline.min_sites
                    ),
                ));
            }
            std::thread::sleep(self.controller.task_check_period());
        }
    }

    fn dispatch_to(&self, targets: &[String], first: bool) -> DispatchSpec {
        // later phases only address the sites that answered the first one
        let min_responses = if first {
            self.pipeline.min_responses
        } else {
            self.pipeline.min_responses.min(targets.len())
        };
        DispatchSpec {
            targets: Some(targets.to_vec()),
            min_responses,
            grace: self.pipeline.grace(),
            timeout: self.pipeline.task_timeout(),
        }
    }

    /// Run every phase in order
    pub fn run(&self) -> FedResult<GlobalStats> {
        let result = self.run_phases();
        if let Err(e) = &result {
            if e.is_aborted() {
                warn!(error = %e, "pipeline aborted");
            } else {
                error!(error = %e, "pipeline failed, no result published");
            }
        }
        result
    }

    fn run_phases(&self) -> FedResult<GlobalStats> {
        let sites = self.wait_for_sites()?;
        let runner = PhaseRunner::new(self.controller);
        let mut dropped = Vec::new();

        let summary = runner.run(&SummaryPhase, &(), &self.dispatch_to(&sites, true))?;
        note_dropped(&mut dropped, TASK_CLIENT_STATS, &summary.state.failures);
        let participants = summary.contributors();

        let variance = runner.run(
            &VariancePhase,
            &summary.output,
            &self.dispatch_to(&participants, false),
        )?;
        note_dropped(&mut dropped, TASK_AGGREGATE_VAR, &variance.state.failures);

        let median = if self.quantile.enabled {
            let mut protocol = QuantileProtocol::new(
                self.controller,
                participants.clone(),
                self.quantile,
                self.pipeline.task_timeout(),
            );
            let outcome = protocol.run(&summary.output)?;
            for (site, task, code) in &outcome.failures {
                dropped.push((site.clone(), task.clone(), *code));
            }
            outcome
        } else {
            info!(phase = TASK_AGGREGATE_MEDIAN, "median protocol disabled");
            QuantileOutcome::default()
        };

        let histogram = runner.run(
            &HistogramPhase::new(self.pipeline.histogram_bins),
            &summary.output,
            &self.dispatch_to(&participants, false),
        )?;
        note_dropped(&mut dropped, TASK_AGGREGATE_HISTOGRAM, &histogram.state.failures);

        Ok(GlobalStats {
            created_at: Utc::now(),
            sites: participants,
            per_site: summary.state.results,
            summary: summary.output,
            dispersion: variance.output,
            medians: median.medians,
            median_rounds: median.rounds,
            median_converged: median.converged,
            histograms: histogram.output,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FeatureSummary;
    use crate::task::DataKind;
    use std::thread;

    fn controller_with(clients: &[&str]) -> Arc<Controller> {
        let controller = Arc::new(Controller::new(Duration::from_millis(5)));
        for c in clients {
            controller.register_client(c);
        }
        controller
    }

    /// Answer one summary task per site with the given values or code
    fn answer_summaries(controller: &Controller, answers: &[(&str, Result<Vec<f64>, ReturnCode>)]) {
        for (site, answer) in answers {
            let pulled = controller.on_client_pull(site).unwrap();
            let env = match answer {
                Ok(values) => {
                    let mut local = LocalSummary {
                        rows: values.len() as u64,
                        ..Default::default()
                    };
                    local
                        .features
                        .insert("x".to_string(), FeatureSummary::from_values(values, 0));
                    Envelope::encode(DataKind::Analytic, &local).unwrap()
                }
                Err(code) => Envelope::reply(*code),
            };
            controller.on_result(pulled.task_id, site, env).unwrap();
        }
    }

    fn spec(targets: &[&str], min: usize) -> DispatchSpec {
        DispatchSpec {
            targets: Some(targets.iter().map(|s| s.to_string()).collect()),
            min_responses: min,
            grace: Duration::ZERO,
            timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_summary_phase_mean() {
        let controller = controller_with(&["a", "b", "c"]);
        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                while controller.standing_tasks().is_empty() {
                    thread::sleep(Duration::from_millis(1));
                }
                answer_summaries(
                    &controller,
                    &[
                        ("a", Ok(vec![1.0; 10])),
                        ("b", Ok(vec![2.0; 10])),
                        ("c", Ok(vec![3.0; 10])),
                    ],
                );
            })
        };
        let runner = PhaseRunner::new(&controller);
        let outcome = runner.run(&SummaryPhase, &(), &spec(&["a", "b", "c"], 3)).unwrap();
        worker.join().unwrap();

        assert_eq!(outcome.output.features["x"].count, 30);
        assert!((outcome.output.features["x"].mean - 2.0).abs() < 1e-12);
        for (site, mean) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            assert_eq!(outcome.state.results[site].features["x"].mean, mean);
        }
        assert_eq!(outcome.output.features["x"].min, 1.0);
        assert_eq!(outcome.output.features["x"].max, 3.0);
    }

    #[test]
    fn test_partial_failure_dropped_from_aggregate() {
        let controller = controller_with(&["a", "b", "c"]);
        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                while controller.standing_tasks().is_empty() {
                    thread::sleep(Duration::from_millis(1));
                }
                answer_summaries(
                    &controller,
                    &[
                        ("a", Ok(vec![1.0])),
                        ("b", Ok(vec![3.0])),
                        ("c", Err(ReturnCode::Error)),
                    ],
                );
            })
        };
        let runner = PhaseRunner::new(&controller);
        let mut dispatch = spec(&["a", "b", "c"], 2);
        // all three answers land inside the grace period
        dispatch.grace = Duration::from_millis(200);
        let outcome = runner.run(&SummaryPhase, &(), &dispatch).unwrap();
        worker.join().unwrap();

        assert_eq!(outcome.contributors(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(outcome.state.failures, vec![("c".to_string(), ReturnCode::Error)]);
        assert_eq!(outcome.output.features["x"].mean, 2.0);
    }

    #[test]
    fn test_phase_without_results_fails() {
        let controller = controller_with(&["a"]);
        let worker = {
            let controller = controller.clone();
            thread::spawn(move || {
                while controller.standing_tasks().is_empty() {
                    thread::sleep(Duration::from_millis(1));
                }
                answer_summaries(&controller, &[("a", Err(ReturnCode::ExecutionException))]);
            })
        };
        let runner = PhaseRunner::new(&controller);
        let err = runner.run(&SummaryPhase, &(), &spec(&["a"], 1)).unwrap_err();
        worker.join().unwrap();
        assert!(matches!(err, FedError::Phase { .. }));
    }

    #[test]
    fn test_wait_for_sites_aborts() {
        let controller = controller_with(&["a"]);
        let pipeline = PipelineConfig {
            min_sites: 2,
            site_wait_timeout_secs: 0,
            ..PipelineConfig::default()
        };
        let quantile = QuantileConfig::default();
        let stats = StatsPipeline::new(&controller, &pipeline, &quantile);

        controller.abort_signal().trigger();
        assert!(stats.wait_for_sites().unwrap_err().is_aborted());
    }

    #[test]
    fn test_cancelled_pipeline_publishes_nothing() {
        let controller = controller_with(&["a", "b", "c"]);
        let pipeline = PipelineConfig {
            min_sites: 3,
            ..PipelineConfig::default()
        };
        let quantile = QuantileConfig::default();
        let signal = controller.abort_signal();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signal.trigger();
        });
        let result = StatsPipeline::new(&controller, &pipeline, &quantile).run();
        trigger.join().unwrap();
        assert!(result.unwrap_err().is_aborted());
    }
}
