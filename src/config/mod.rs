//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! Three files are read from disk:
//!
//! - `server.toml` → [`Config`] (`[server]`, `[pipeline]`, `[quantile]`, `[output]`)
//! - `simulate.toml` → [`SimulateConfig`]
//! - `<job_folder>/job.toml` → [`JobConfig`]
//!
//! Durations are whole seconds in TOML (`*_secs`) and human strings on the
//! command line (`30s`, `5m`).

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use crate::task::DataKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub quantile: QuantileConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Listening sockets and engine tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Site protocol listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Admin control-channel listen address
    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,
    /// Exit-check interval of the dispatch engine (milliseconds)
    #[serde(default = "default_task_check_period_ms")]
    pub task_check_period_ms: u64,
    /// Back-off suggested to sites when no task is standing (milliseconds)
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
    /// Run the statistics pipeline once enough sites have registered
    #[serde(default = "default_true")]
    pub run_pipeline: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8002".to_string()
}

fn default_admin_listen() -> String {
    "127.0.0.1:8003".to_string()
}

fn default_task_check_period_ms() -> u64 {
    500
}

fn default_retry_after_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    pub fn task_check_period(&self) -> Duration {
        Duration::from_millis(self.task_check_period_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            task_check_period_ms: default_task_check_period_ms(),
            retry_after_ms: default_retry_after_ms(),
            run_pipeline: true,
        }
    }
}

/// Statistics pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sites that must register before the first phase is scheduled
    #[serde(default = "default_min_sites")]
    pub min_sites: usize,
    /// Give up waiting for sites after this long (0 = wait forever)
    #[serde(default = "default_site_wait_timeout_secs")]
    pub site_wait_timeout_secs: u64,
    /// Results required per phase (0 = every target)
    #[serde(default)]
    pub min_responses: usize,
    /// Extra wait after min_responses is reached
    #[serde(default)]
    pub grace_secs: u64,
    /// Per-phase task timeout (0 = none)
    #[serde(default)]
    pub task_timeout_secs: u64,
    /// Equal-width bins per feature histogram
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
}

fn default_min_sites() -> usize {
    1
}

fn default_site_wait_timeout_secs() -> u64 {
    300
}

fn default_histogram_bins() -> usize {
    10
}

impl PipelineConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn site_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.site_wait_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_sites: default_min_sites(),
            site_wait_timeout_secs: default_site_wait_timeout_secs(),
            min_responses: 0,
            grace_secs: 0,
            task_timeout_secs: 0,
            histogram_bins: default_histogram_bins(),
        }
    }
}

/// Distributed median settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rounds before unfinished features are reported as not converged
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Results required per protocol task (0 = every target)
    #[serde(default)]
    pub min_responses: usize,
    /// Seed of the pivot-selection RNG (random if unset)
    #[serde(default)]
    pub seed: Option<u64>,
    /// How long the pivot-sampling site may hold its assignment (0 = forever)
    #[serde(default = "default_assignment_timeout_secs")]
    pub assignment_timeout_secs: u64,
}

fn default_max_rounds() -> u32 {
    30
}

fn default_assignment_timeout_secs() -> u64 {
    10
}

impl QuantileConfig {
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs)
    }
}

impl Default for QuantileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: default_max_rounds(),
            min_responses: 0,
            seed: None,
            assignment_timeout_secs: default_assignment_timeout_secs(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// JSON artifact file path or directory
    pub json_output: Option<PathBuf>,
    /// File name used when `json_output` is a directory
    #[serde(default = "default_json_name")]
    pub json_name: String,
    /// Include per-site summaries in the text report
    #[serde(default)]
    pub per_site: bool,
    /// Print histogram buckets in the text report
    #[serde(default)]
    pub show_histogram: bool,
}

fn default_json_name() -> String {
    "global_stats".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            json_output: None,
            json_name: default_json_name(),
            per_site: false,
            show_histogram: false,
        }
    }
}

/// Settings of one site process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Site identity (defaults to the host name)
    pub name: Option<String>,
    /// Server site-protocol address
    pub server: String,
    /// Local CSV file
    pub data: PathBuf,
    /// Pull interval while idle (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seed of the local sampling RNG
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl SiteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Configured name, else the host name
    pub fn site_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "site".to_string())
        })
    }
}

/// In-process simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateConfig {
    #[serde(default = "default_sim_sites")]
    pub sites: usize,
    #[serde(default = "default_rows_per_site")]
    pub rows_per_site: usize,
    /// Synthetic feature columns
    #[serde(default = "default_features")]
    pub features: Vec<FeatureDistribution>,
    /// Share of cells written as missing (0.0-1.0)
    #[serde(default)]
    pub missing_rate: f64,
    /// Seeds data generation, site sampling and pivot selection
    #[serde(default)]
    pub seed: Option<u64>,
    /// Per-site CSV files instead of synthetic data (overrides `sites`)
    #[serde(default)]
    pub data_files: Vec<PathBuf>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub quantile: QuantileConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_sim_sites() -> usize {
    5
}

fn default_rows_per_site() -> usize {
    200
}

fn default_features() -> Vec<FeatureDistribution> {
    vec![
        FeatureDistribution {
            name: "age".to_string(),
            distribution: DistributionType::Normal {
                mean: 45.0,
                std_dev: 12.0,
            },
        },
        FeatureDistribution {
            name: "income".to_string(),
            distribution: DistributionType::LogNormal {
                mu: 10.5,
                sigma: 0.5,
            },
        },
        FeatureDistribution {
            name: "visits".to_string(),
            distribution: DistributionType::Uniform { low: 0.0, high: 20.0 },
        },
    ]
}

impl SimulateConfig {
    /// Number of simulated sites, one per data file when files are given
    pub fn site_count(&self) -> usize {
        if self.data_files.is_empty() {
            self.sites
        } else {
            self.data_files.len()
        }
    }
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            sites: default_sim_sites(),
            rows_per_site: default_rows_per_site(),
            features: default_features(),
            missing_rate: 0.0,
            seed: None,
            data_files: Vec::new(),
            pipeline: PipelineConfig::default(),
            quantile: QuantileConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

/// One synthetic column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDistribution {
    pub name: String,
    pub distribution: DistributionType,
}

/// Value distribution of a synthetic column
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistributionType {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
    LogNormal { mu: f64, sigma: f64 },
    /// Integers in `[0, levels)`; exercises ties in the median protocol
    Discrete { levels: u32 },
}

impl fmt::Display for DistributionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uniform { low, high } => write!(f, "uniform[{}, {})", low, high),
            Self::Normal { mean, std_dev } => write!(f, "normal(μ={}, σ={})", mean, std_dev),
            Self::LogNormal { mu, sigma } => write!(f, "lognormal(μ={}, σ={})", mu, sigma),
            Self::Discrete { levels } => write!(f, "discrete({} levels)", levels),
        }
    }
}

/// How a job's task is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStrategy {
    Broadcast,
    BroadcastForever,
    SendSequential,
    SendRandom,
    RelaySequential,
    RelayAny,
}

impl Default for JobStrategy {
    fn default() -> Self {
        Self::Broadcast
    }
}

impl fmt::Display for JobStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Broadcast => "broadcast",
            Self::BroadcastForever => "broadcast_forever",
            Self::SendSequential => "send_sequential",
            Self::SendRandom => "send_random",
            Self::RelaySequential => "relay_sequential",
            Self::RelayAny => "relay_any",
        };
        f.write_str(s)
    }
}

/// `job.toml` of a job folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub task_name: String,
    /// Explicit targets (all known sites if unset)
    #[serde(default)]
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub strategy: JobStrategy,
    /// Results required (0 = every target)
    #[serde(default)]
    pub min_responses: usize,
    #[serde(default)]
    pub grace_secs: u64,
    /// Task timeout (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
    /// Assignment timeout of send/relay strategies (0 = none)
    #[serde(default)]
    pub assignment_timeout_secs: u64,
    #[serde(default)]
    pub data_kind: DataKind,
    /// Payload blob, relative to the job folder
    #[serde(default)]
    pub payload: Option<PathBuf>,
}

impl JobConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_secs(self.assignment_timeout_secs)
    }
}
