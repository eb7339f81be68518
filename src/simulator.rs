//! In-process federation
//!
//! Runs a [`Controller`], one thread per simulated site and the statistics
//! pipeline in a single process. Sites pull through the same controller API the
//! TCP server uses, so the engine sees exactly the traffic of a real deployment.
//!
//! # Architecture
//!
//! ```text
//! main thread:  StatsPipeline::run ──► Controller ◄── site-1 thread (pull/execute/result)
//!                                                 ◄── site-2 thread
//!                                                 ◄── ...
//! ```
//!
//! Site threads are scoped and borrow the controller. Each reports its task
//! count over a channel when the stop signal ends it.

use crate::config::validator::validate_simulate;
use crate::config::{DistributionType, FeatureDistribution, SimulateConfig};
use crate::controller::{Controller, Signal};
use crate::pipeline::{GlobalStats, StatsPipeline};
use crate::site::{Column, Dataset, SiteExecutor, StatsExecutor};
use crate::Result;
use anyhow::{anyhow, Context};
use crossbeam::channel;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal, Uniform};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Poll period of the engine and idle back-off of the site threads
const SIM_TICK: Duration = Duration::from_millis(10);

/// Result of one simulated run
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub stats: GlobalStats,
    pub elapsed: Duration,
    /// Tasks executed per site
    pub site_tasks: BTreeMap<String, u64>,
}

pub struct Simulator {
    config: SimulateConfig,
}

impl Simulator {
    pub fn new(config: SimulateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulateConfig {
        &self.config
    }

    /// Site names and their tables
    ///
    /// Data files are loaded as-is (site named after the file stem); otherwise
    /// every site gets `rows_per_site` synthetic rows seeded with `seed + i`.
    pub fn datasets(&self) -> Result<Vec<(String, Dataset)>> {
        if !self.config.data_files.is_empty() {
            return self
                .config
                .data_files
                .iter()
                .enumerate()
                .map(|(i, path)| {
                    let name = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| format!("site-{}", i + 1));
                    Ok((name, Dataset::from_csv_path(path)?))
                })
                .collect();
        }

        (0..self.config.sites)
            .map(|i| {
                let mut rng = match self.config.seed {
                    Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed.wrapping_add(i as u64)),
                    None => Xoshiro256PlusPlus::from_entropy(),
                };
                let dataset = synthesize(
                    &self.config.features,
                    self.config.rows_per_site,
                    self.config.missing_rate,
                    &mut rng,
                )?;
                Ok((format!("site-{}", i + 1), dataset))
            })
            .collect()
    }

    /// Run the whole pipeline against simulated sites
    pub fn run(&self) -> Result<SimulationReport> {
        validate_simulate(&self.config)?;
        let datasets = self.datasets()?;

        let controller = Controller::new(SIM_TICK);
        for (name, _) in &datasets {
            controller.register_client(name);
        }

        let mut pipeline = self.config.pipeline.clone();
        pipeline.min_sites = datasets.len();
        let mut quantile = self.config.quantile.clone();
        if quantile.seed.is_none() {
            quantile.seed = self.config.seed;
        }

        info!(
            sites = datasets.len(),
            rows_per_site = self.config.rows_per_site,
            "starting simulation"
        );

        let stop = Signal::new();
        let (tx, rx) = channel::unbounded();
        let started = Instant::now();

        let result = crossbeam::thread::scope(|scope| {
            for (i, (name, dataset)) in datasets.into_iter().enumerate() {
                let seed = self.config.seed.map(|s| s.wrapping_add(i as u64));
                let executor = StatsExecutor::new(dataset, seed);
                let tx = tx.clone();
                let controller = &controller;
                let stop = &stop;
                scope.spawn(move |_| {
                    let executed = site_loop(controller, &name, executor, stop);
                    let _ = tx.send((name, executed));
                });
            }

            let result = StatsPipeline::new(&controller, &pipeline, &quantile).run();
            stop.trigger();
            result
        })
        .map_err(|_| anyhow!("Simulated site thread panicked"))?;
        drop(tx);

        let stats = result.context("Simulated pipeline failed")?;
        let site_tasks = rx.try_iter().collect();
        Ok(SimulationReport {
            stats,
            elapsed: started.elapsed(),
            site_tasks,
        })
    }
}

fn site_loop(
    controller: &Controller,
    name: &str,
    mut executor: StatsExecutor,
    stop: &Signal,
) -> u64 {
    let abort = controller.abort_signal();
    let mut executed = 0;
    while !stop.triggered() {
        match controller.on_client_pull(name) {
            Some(pulled) => {
                let result = executor.execute(&pulled.task_name, &pulled.payload, &abort);
                executed += 1;
                if let Err(e) = controller.on_result(pulled.task_id, name, result) {
                    debug!(site = name, task = %pulled.task_name, error = %e, "result refused");
                }
            }
            None => std::thread::sleep(SIM_TICK),
        }
    }
    debug!(site = name, executed, "site thread stopped");
    executed
}

/// Generate one synthetic table
fn synthesize<R: Rng>(
    features: &[FeatureDistribution],
    rows: usize,
    missing_rate: f64,
    rng: &mut R,
) -> Result<Dataset> {
    let missing_rate = missing_rate.clamp(0.0, 1.0);
    let mut columns = BTreeMap::new();
    for feature in features {
        let sampler = Sampler::new(feature)?;
        let mut column = Column::default();
        for _ in 0..rows {
            if missing_rate > 0.0 && rng.gen_bool(missing_rate) {
                column.missing += 1;
            } else {
                column.values.push(sampler.sample(rng));
            }
        }
        columns.insert(feature.name.clone(), column);
    }
    Ok(Dataset::from_columns(rows as u64, columns))
}

enum Sampler {
    Uniform(Uniform<f64>),
    Normal(Normal<f64>),
    LogNormal(LogNormal<f64>),
    Discrete(u32),
}

impl Sampler {
    fn new(feature: &FeatureDistribution) -> Result<Self> {
        let sampler = match feature.distribution {
            DistributionType::Uniform { low, high } => {
                if !(low < high) {
                    anyhow::bail!(
                        "Feature '{}': uniform low {} must be below high {}",
                        feature.name,
                        low,
                        high
                    );
                }
                Sampler::Uniform(Uniform::new(low, high))
            }
            DistributionType::Normal { mean, std_dev } => Sampler::Normal(
                Normal::new(mean, std_dev)
                    .map_err(|e| anyhow!("Feature '{}': {}", feature.name, e))?,
            ),
            DistributionType::LogNormal { mu, sigma } => Sampler::LogNormal(
                LogNormal::new(mu, sigma)
                    .map_err(|e| anyhow!("Feature '{}': {}", feature.name, e))?,
            ),
            DistributionType::Discrete { levels } => Sampler::Discrete(levels.max(1)),
        };
        Ok(sampler)
    }

    #[inline]
    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        match self {
            Sampler::Uniform(d) => d.sample(rng),
            Sampler::Normal(d) => d.sample(rng),
            Sampler::LogNormal(d) => d.sample(rng),
            Sampler::Discrete(levels) => rng.gen_range(0..*levels) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantileConfig;

    fn discrete_config() -> SimulateConfig {
        SimulateConfig {
            sites: 3,
            rows_per_site: 150,
            features: vec![FeatureDistribution {
                name: "level".to_string(),
                distribution: DistributionType::Discrete { levels: 11 },
            }],
            seed: Some(7),
            quantile: QuantileConfig {
                seed: Some(7),
                ..QuantileConfig::default()
            },
            ..SimulateConfig::default()
        }
    }

    #[test]
    fn test_synthetic_data_is_seeded() {
        let sim = Simulator::new(discrete_config());
        let first = sim.datasets().unwrap();
        let second = sim.datasets().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(first[0].0, "site-1");
        assert_eq!(first[0].1.rows(), 150);
        // sites draw from different streams
        assert_ne!(first[0].1, first[1].1);
    }

    #[test]
    fn test_missing_rate() {
        let mut config = discrete_config();
        config.missing_rate = 1.0;
        let sets = Simulator::new(config).datasets().unwrap();
        let column = sets[0].1.column("level").unwrap();
        assert_eq!(column.missing, 150);
        assert!(column.values.is_empty());
    }

    #[test]
    fn test_discrete_run_matches_direct_statistics() {
        let sim = Simulator::new(discrete_config());
        let mut all: Vec<f64> = sim
            .datasets()
            .unwrap()
            .iter()
            .flat_map(|(_, d)| d.column("level").unwrap().values.clone())
            .collect();

        let report = sim.run().unwrap();
        let stats = &report.stats;
        assert_eq!(stats.sites.len(), 3);
        assert_eq!(stats.summary.rows, 450);

        let feature = &stats.summary.features["level"];
        let direct_mean = all.iter().sum::<f64>() / all.len() as f64;
        assert_eq!(feature.count, all.len() as u64);
        assert!((feature.mean - direct_mean).abs() < 1e-9);

        assert!(stats.median_converged);
        let median = stats.medians["level"].unwrap();
        // the k-th largest value, k = ceil(N/2), lies in the pivot's block of ties
        all.sort_by(|a, b| b.total_cmp(a));
        let k = (all.len() + 1) / 2;
        let above = all.iter().filter(|v| **v > median).count();
        let through = all.iter().filter(|v| **v >= median).count();
        assert!(
            above < k + 5 && through + 5 >= k,
            "median {} covers ranks {}..{}, k = {}",
            median,
            above,
            through,
            k
        );

        assert_eq!(report.site_tasks.len(), 3);
        assert!(report.site_tasks.values().all(|n| *n > 0));
    }

    #[test]
    fn test_csv_sites() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("north.csv");
        let b = dir.path().join("south.csv");
        std::fs::write(&a, "x,label\n1,a\n2,b\n3,c\n").unwrap();
        std::fs::write(&b, "x,label\n4,d\n?,e\n6,f\n").unwrap();

        let config = SimulateConfig {
            data_files: vec![a, b],
            seed: Some(3),
            ..SimulateConfig::default()
        };
        let report = Simulator::new(config).run().unwrap();
        let stats = &report.stats;
        assert_eq!(stats.sites, vec!["north".to_string(), "south".to_string()]);
        assert_eq!(stats.summary.rows, 6);

        let x = &stats.summary.features["x"];
        assert_eq!(x.count, 5);
        assert_eq!(x.missing, 1);
        assert!((x.mean - 3.2).abs() < 1e-9);
        assert!(!stats.summary.features.contains_key("label"));
    }
}
