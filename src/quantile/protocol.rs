//! Multi-round quantile driver
//!
//! Runs the median protocol on top of a [`Controller`]: pivot selection,
//! size collection and purge are ordinary tasks, each scheduled and awaited
//! in turn. Per-feature state lives in this driver for the duration of one
//! run and is never shared.

use crate::config::QuantileConfig;
use crate::controller::{callback, lock, Controller, TaskOutcome};
use crate::dispatch::{Broadcast, DispatchStrategy, SendOne};
use crate::error::{FedError, FedResult};
use crate::quantile::{
    CountRequest, CountResponse, MedianAction, PartitionCounts, PurgeRequest, PurgeResponse,
    QuantileRoundState, SampleRequest, SampleResponse, TASK_AGGREGATE_MEDIAN, TASK_DATA_PURGE,
    TASK_RANDOM_SELECT, TASK_SIZE_COLLECTION,
};
use crate::stats::GlobalSummary;
use crate::task::{DataKind, Envelope, ReturnCode, Task};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of one protocol run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuantileOutcome {
    /// Accepted pivot per feature; `None` for features without values
    pub medians: BTreeMap<String, Option<f64>>,
    pub states: BTreeMap<String, QuantileRoundState>,
    /// Number of rounds executed
    pub rounds: u32,
    /// False when the round cap stopped unfinished features
    pub converged: bool,
    /// Results rejected as protocol violations (client, detail)
    pub rejected: Vec<(String, String)>,
    /// Non-OK results (client, task, code)
    pub failures: Vec<(String, String, ReturnCode)>,
}

/// Median protocol driver
pub struct QuantileProtocol<'a> {
    controller: &'a Controller,
    targets: Vec<String>,
    max_rounds: u32,
    min_responses: usize,
    task_timeout: Duration,
    assignment_timeout: Duration,
    rng: Xoshiro256PlusPlus,
    /// Last reported working-set size: site → feature → remaining
    remaining: BTreeMap<String, BTreeMap<String, u64>>,
    rejected: Vec<(String, String)>,
    failures: Vec<(String, String, ReturnCode)>,
}

impl<'a> QuantileProtocol<'a> {
    /// # Arguments
    ///
    /// * `controller` - Engine the protocol tasks are scheduled on
    /// * `targets` - Sites taking part (those that answered the summary phase)
    /// * `config` - Round cap, seed and assignment timeout
    /// * `task_timeout` - Overall timeout of every protocol task (zero = none)
    pub fn new(
        controller: &'a Controller,
        targets: Vec<String>,
        config: &QuantileConfig,
        task_timeout: Duration,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::seed_from_u64(rand::random()),
        };
        Self {
            controller,
            targets,
            max_rounds: config.max_rounds,
            min_responses: config.min_responses,
            task_timeout,
            assignment_timeout: config.assignment_timeout(),
            rng,
            remaining: BTreeMap::new(),
            rejected: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Run rounds until every feature stops or the round cap is hit
    pub fn run(&mut self, summary: &GlobalSummary) -> FedResult<QuantileOutcome> {
        if self.targets.is_empty() {
            return Err(FedError::phase(TASK_AGGREGATE_MEDIAN, "no sites to query"));
        }

        let mut states: BTreeMap<String, QuantileRoundState> = summary
            .features
            .iter()
            .filter(|(_, f)| f.count > 0)
            .map(|(name, f)| (name.clone(), QuantileRoundState::new(f.count)))
            .collect();

        let mut pivots = self.initial_pivots(summary, &states);
        for (name, state) in states.iter_mut() {
            if !pivots.contains_key(name) {
                warn!(feature = %name, "no local median to seed the first round");
                state.force_stop();
            }
        }

        let mut round = 1u32;
        let mut converged = true;
        let mut executed = 0u32;
        loop {
            let mut active: Vec<String> = states
                .iter()
                .filter(|(_, s)| !s.is_stopped())
                .map(|(n, _)| n.clone())
                .collect();
            if active.is_empty() {
                break;
            }
            if round > self.max_rounds {
                warn!(
                    max_rounds = self.max_rounds,
                    unfinished = active.len(),
                    "round cap reached, accepting current pivots"
                );
                for name in &active {
                    if let Some(state) = states.get_mut(name) {
                        state.force_stop();
                    }
                }
                converged = false;
                break;
            }

            if round > 1 {
                pivots = self.sample_pivots(round, &active)?;
                for name in &active {
                    if !pivots.contains_key(name) {
                        debug!(feature = %name, round, "no values left to sample");
                        if let Some(state) = states.get_mut(name) {
                            state.force_stop();
                        }
                    }
                }
                active.retain(|n| pivots.contains_key(n));
                if active.is_empty() {
                    break;
                }
            }

            let round_pivots: BTreeMap<String, f64> = active
                .iter()
                .filter_map(|n| pivots.get(n).map(|p| (n.clone(), *p)))
                .collect();
            info!(round, features = round_pivots.len(), "quantile round");
            let counts = self.collect_sizes(round, &round_pivots)?;
            executed = round;

            let mut actions = BTreeMap::new();
            for (name, pivot) in &round_pivots {
                let Some(state) = states.get_mut(name) else {
                    continue;
                };
                let triple = counts.get(name).copied().unwrap_or_default();
                let action = state.decide(round, *pivot, triple);
                debug!(
                    feature = %name,
                    round,
                    pivot,
                    greater = triple.greater,
                    equal = triple.equal,
                    less = triple.less,
                    k = state.k,
                    action = %action,
                    "round decision"
                );
                if action.is_discard() {
                    actions.insert(name.clone(), (action, *pivot));
                }
            }

            if !actions.is_empty() {
                self.purge(round, actions)?;
            }
            round += 1;
        }

        let medians = summary
            .features
            .keys()
            .map(|name| (name.clone(), states.get(name).and_then(|s| s.pivot)))
            .collect();
        info!(rounds = executed, converged, "quantile protocol finished");
        Ok(QuantileOutcome {
            medians,
            states,
            rounds: executed,
            converged,
            rejected: std::mem::take(&mut self.rejected),
            failures: std::mem::take(&mut self.failures),
        })
    }

    /// Round 1 pivots: the local medians of one randomly chosen site
    ///
    /// Features the chosen site has no median for fall back to any other
    /// site's median.
    fn initial_pivots(
        &mut self,
        summary: &GlobalSummary,
        states: &BTreeMap<String, QuantileRoundState>,
    ) -> BTreeMap<String, f64> {
        let chosen = self.targets[self.rng.gen_range(0..self.targets.len())].clone();
        debug!(site = %chosen, "round 1 pivots from local medians");
        states
            .keys()
            .filter_map(|name| {
                let medians = &summary.features.get(name)?.site_medians;
                medians
                    .get(&chosen)
                    .or_else(|| medians.values().next())
                    .map(|m| (name.clone(), *m))
            })
            .collect()
    }

    /// Round ≥2 pivots sampled by one shuffled site, with fallbacks for
    /// features that site has no values left for
    fn sample_pivots(&mut self, round: u32, features: &[String]) -> FedResult<BTreeMap<String, f64>> {
        let mut pool = self.targets.clone();
        pool.shuffle(&mut self.rng);

        let request = SampleRequest {
            round,
            features: features.to_vec(),
        };
        let strategy = SendOne::sequential().with_assignment_timeout(self.assignment_timeout);
        let responses = self.exchange::<_, SampleResponse, _>(
            TASK_RANDOM_SELECT,
            round,
            &request,
            Box::new(strategy),
            pool.clone(),
            1,
            sample_validator(features),
        )?;

        let mut pivots = BTreeMap::new();
        let mut asked: BTreeSet<String> = BTreeSet::new();
        for (site, resp) in responses {
            asked.insert(site);
            pivots.extend(resp.pivots);
        }

        // re-sample from sites that still report values for the missing features
        for site in pool {
            let missing: Vec<String> = features
                .iter()
                .filter(|f| !pivots.contains_key(*f))
                .cloned()
                .collect();
            if missing.is_empty() {
                break;
            }
            if asked.contains(&site) {
                continue;
            }
            let has_values: Vec<String> = missing
                .into_iter()
                .filter(|f| {
                    self.remaining
                        .get(&site)
                        .and_then(|r| r.get(f))
                        .copied()
                        .unwrap_or(0)
                        > 0
                })
                .collect();
            if has_values.is_empty() {
                continue;
            }
            asked.insert(site.clone());
            debug!(site = %site, round, features = has_values.len(), "re-sampling pivots");
            let request = SampleRequest {
                round,
                features: has_values.clone(),
            };
            let strategy = SendOne::sequential().with_assignment_timeout(self.assignment_timeout);
            let responses = self.exchange::<_, SampleResponse, _>(
                TASK_RANDOM_SELECT,
                round,
                &request,
                Box::new(strategy),
                vec![site],
                1,
                sample_validator(&has_values),
            )?;
            for (_, resp) in responses {
                pivots.extend(resp.pivots);
            }
        }
        Ok(pivots)
    }

    /// Broadcast the pivots and sum the per-site triples
    fn collect_sizes(
        &mut self,
        round: u32,
        pivots: &BTreeMap<String, f64>,
    ) -> FedResult<BTreeMap<String, PartitionCounts>> {
        let request = CountRequest {
            round,
            pivots: pivots.clone(),
        };
        let expected: BTreeSet<String> = pivots.keys().cloned().collect();
        let responses = self.exchange::<_, CountResponse, _>(
            TASK_SIZE_COLLECTION,
            round,
            &request,
            Box::new(Broadcast::new()),
            self.targets.clone(),
            self.min_responses,
            move |resp: &CountResponse| {
                let got: BTreeSet<&String> = resp.counts.keys().collect();
                if got.len() != expected.len() || !expected.iter().all(|f| got.contains(f)) {
                    return Err(format!(
                        "feature set mismatch: expected {:?}, got {:?}",
                        expected, got
                    ));
                }
                Ok(())
            },
        )?;
        if responses.is_empty() {
            return Err(FedError::phase(
                TASK_SIZE_COLLECTION,
                format!("no site returned counts in round {}", round),
            ));
        }

        let mut totals: BTreeMap<String, PartitionCounts> = BTreeMap::new();
        for (site, resp) in responses {
            let remaining = self.remaining.entry(site).or_default();
            for (name, counts) in resp.counts {
                remaining.insert(name.clone(), counts.total());
                totals.entry(name).or_default().add(&counts);
            }
        }
        Ok(totals)
    }

    /// Tell every site which partition to drop
    fn purge(&mut self, round: u32, actions: BTreeMap<String, (MedianAction, f64)>) -> FedResult<()> {
        let expected: BTreeSet<String> = actions.keys().cloned().collect();
        let request = PurgeRequest { round, actions };
        let responses = self.exchange::<_, PurgeResponse, _>(
            TASK_DATA_PURGE,
            round,
            &request,
            Box::new(Broadcast::new()),
            self.targets.clone(),
            self.min_responses,
            move |resp: &PurgeResponse| {
                if resp.remaining.keys().all(|f| expected.contains(f))
                    && resp.remaining.len() == expected.len()
                {
                    Ok(())
                } else {
                    Err("purge acknowledgement covers other features".to_string())
                }
            },
        )?;
        if responses.is_empty() {
            return Err(FedError::phase(
                TASK_DATA_PURGE,
                format!("no site acknowledged the purge in round {}", round),
            ));
        }

        // a site that kept its working set would report stale counts next round
        let acknowledged: BTreeSet<String> = responses.iter().map(|(s, _)| s.clone()).collect();
        for site in self.targets.iter().filter(|t| !acknowledged.contains(*t)) {
            warn!(site = %site, round, "purge not acknowledged, site leaves the protocol");
            if !self
                .failures
                .iter()
                .any(|(client, task, _)| client == site && task == TASK_DATA_PURGE)
            {
                self.failures
                    .push((site.clone(), TASK_DATA_PURGE.to_string(), ReturnCode::Error));
            }
            self.remaining.remove(site);
        }
        self.targets.retain(|t| acknowledged.contains(t));

        for (site, resp) in responses {
            self.remaining.entry(site).or_default().extend(resp.remaining);
        }
        Ok(())
    }

    /// Schedule one protocol task and collect the validated responses
    ///
    /// Responses carrying another round number, undecodable blobs and
    /// responses failing `validate` are rejected and never collected.
    #[allow(clippy::too_many_arguments)]
    fn exchange<Req, Resp, V>(
        &mut self,
        name: &str,
        round: u32,
        request: &Req,
        strategy: Box<dyn DispatchStrategy>,
        targets: Vec<String>,
        min_responses: usize,
        validate: V,
    ) -> FedResult<Vec<(String, Resp)>>
    where
        Req: Serialize,
        Resp: DeserializeOwned + RoundTagged + Send + 'static,
        V: Fn(&Resp) -> Result<(), String> + Send + 'static,
    {
        let payload = Envelope::encode(DataKind::Analytic, request)?.with_round(round);
        let min_responses = min_responses.min(targets.len());
        let task = Task::new(name, payload)
            .with_min_responses(min_responses)
            .with_timeout(self.task_timeout);

        let collected: Arc<Mutex<Vec<(String, Resp)>>> = Arc::new(Mutex::new(Vec::new()));
        let rejected: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        let reject_sink = rejected.clone();

        let on_result = callback(move |r| {
            if !r.envelope.is_ok() {
                return Ok(None);
            }
            let reject = |detail: String| {
                error!(task = r.task_name, client = r.client, %detail, "result rejected");
                lock(&reject_sink).push((r.client.to_string(), detail.clone()));
                FedError::ProtocolInvariant {
                    client: r.client.to_string(),
                    detail,
                }
            };
            if r.envelope.round != Some(round) {
                return Err(reject(format!(
                    "result for round {:?} submitted to round {}",
                    r.envelope.round, round
                )));
            }
            let resp: Resp = r
                .envelope
                .decode()
                .map_err(|e| reject(format!("undecodable result: {}", e)))?;
            if resp.round() != round {
                return Err(reject(format!(
                    "payload tagged round {} submitted to round {}",
                    resp.round(),
                    round
                )));
            }
            validate(&resp).map_err(reject)?;
            lock(&sink).push((r.client.to_string(), resp));
            Ok(None)
        });

        let id = self
            .controller
            .schedule(task, strategy, Some(targets), Some(on_result))?;
        let outcome = self.controller.wait(id)?;
        self.note_failures(&outcome);
        self.rejected.append(&mut lock(&rejected));

        let responses = std::mem::take(&mut *lock(&collected));
        Ok(responses)
    }

    fn note_failures(&mut self, outcome: &TaskOutcome) {
        for (client, code) in outcome.failures() {
            let err = FedError::client_result(client.as_str(), outcome.name.as_str(), code);
            warn!(error = %err, "site dropped from round");
            self.failures.push((client, outcome.name.clone(), code));
        }
    }
}

fn sample_validator(features: &[String]) -> impl Fn(&SampleResponse) -> Result<(), String> + Send + 'static {
    let allowed: BTreeSet<String> = features.iter().cloned().collect();
    move |resp: &SampleResponse| {
        for (name, pivot) in &resp.pivots {
            if !allowed.contains(name) {
                return Err(format!("pivot for unrequested feature '{}'", name));
            }
            if !pivot.is_finite() {
                return Err(format!("non-finite pivot for '{}'", name));
            }
        }
        Ok(())
    }
}

/// Protocol messages that carry their own round number
pub trait RoundTagged {
    fn round(&self) -> u32;
}

impl RoundTagged for SampleResponse {
    fn round(&self) -> u32 {
        self.round
    }
}

impl RoundTagged for CountResponse {
    fn round(&self) -> u32 {
        self.round
    }
}

impl RoundTagged for PurgeResponse {
    fn round(&self) -> u32 {
        self.round
    }
}
