//! TOML configuration file parsing

use super::*;
use crate::config::cli::{ServerArgs, SimulateArgs, SiteArgs};
use crate::config::cli_convert::{parse_duration, parse_duration_ms};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Job description file inside a job folder
pub const JOB_FILE: &str = "job.toml";

fn parse_file<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} file: {}", what, path.display()))?;

    ::toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {} file: {}", what, path.display()))
}

/// Parse server TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    parse_file(path, "config")
}

/// Parse server TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config =
        ::toml::from_str(contents).context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Parse simulation TOML file
pub fn parse_simulate_file(path: &Path) -> Result<SimulateConfig> {
    parse_file(path, "simulation")
}

/// Parse `job.toml` of a job folder
pub fn parse_job_folder(folder: &Path) -> Result<JobConfig> {
    if !folder.is_dir() {
        anyhow::bail!("Job folder does not exist: {}", folder.display());
    }
    parse_file(&folder.join(JOB_FILE), "job")
}

/// Merge server CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_server_args(args: &ServerArgs, mut config: Config) -> Result<Config> {
    if let Some(ref listen) = args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(ref admin) = args.admin_listen {
        config.server.admin_listen = admin.clone();
    }
    if let Some(min_sites) = args.min_sites {
        config.pipeline.min_sites = min_sites;
    }
    if let Some(ref timeout) = args.task_timeout {
        config.pipeline.task_timeout_secs = parse_duration(timeout)?;
    }
    if let Some(ref grace) = args.grace {
        config.pipeline.grace_secs = parse_duration(grace)?;
    }
    if let Some(max_rounds) = args.max_rounds {
        config.quantile.max_rounds = max_rounds;
    }
    if args.seed.is_some() {
        config.quantile.seed = args.seed;
    }
    if args.no_pipeline {
        config.server.run_pipeline = false;
    }
    if args.json_output.is_some() {
        config.output.json_output = args.json_output.clone();
    }

    Ok(config)
}

/// Merge simulate CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_simulate_args(args: &SimulateArgs, mut config: SimulateConfig) -> SimulateConfig {
    if let Some(sites) = args.sites {
        config.sites = sites;
    }
    if let Some(rows) = args.rows {
        config.rows_per_site = rows;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
        config.quantile.seed = args.seed;
    }
    if !args.data.is_empty() {
        config.data_files = args.data.clone();
    }
    if let Some(max_rounds) = args.max_rounds {
        config.quantile.max_rounds = max_rounds;
    }
    if let Some(bins) = args.bins {
        config.pipeline.histogram_bins = bins;
    }
    if args.json_output.is_some() {
        config.output.json_output = args.json_output.clone();
    }
    if args.per_site {
        config.output.per_site = true;
    }
    if args.show_histogram {
        config.output.show_histogram = true;
    }

    config
}

/// Build a site configuration from CLI arguments
pub fn site_config_from_args(args: &SiteArgs) -> Result<SiteConfig> {
    Ok(SiteConfig {
        name: args.name.clone(),
        server: args.server.clone(),
        data: args.data.clone(),
        poll_interval_ms: parse_duration_ms(&args.poll_interval)?,
        seed: args.seed,
    })
}

/// Serialize configuration to TOML
pub fn to_toml_string(config: &Config) -> Result<String> {
    ::toml::to_string_pretty(config).context("Failed to serialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_defaults() {
        let config = parse_toml_string("").unwrap();
        assert_eq!(config.server.task_check_period_ms, 500);
        assert_eq!(config.pipeline.histogram_bins, 10);
        assert_eq!(config.quantile.max_rounds, 30);
        assert_eq!(config.pipeline.min_responses, 0);
        assert!(config.quantile.enabled);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
[server]
listen = "0.0.0.0:9000"

[pipeline]
min_sites = 3
grace_secs = 5

[quantile]
max_rounds = 12
seed = 42
"#;
        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.admin_listen, "127.0.0.1:8003");
        assert_eq!(config.pipeline.min_sites, 3);
        assert_eq!(config.pipeline.grace(), Duration::from_secs(5));
        assert_eq!(config.quantile.max_rounds, 12);
        assert_eq!(config.quantile.seed, Some(42));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = to_toml_string(&config).unwrap();
        let parsed = parse_toml_string(&text).unwrap();
        assert_eq!(parsed.pipeline, config.pipeline);
        assert_eq!(parsed.quantile, config.quantile);
    }

    #[test]
    fn test_parse_job_folder() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join(JOB_FILE)).unwrap();
        writeln!(
            file,
            r#"
task_name = "train"
targets = ["site-1", "site-2"]
strategy = "relay_sequential"
min_responses = 1
timeout_secs = 30
data_kind = "WEIGHTS"
payload = "weights.bin"
"#
        )
        .unwrap();

        let job = parse_job_folder(dir.path()).unwrap();
        assert_eq!(job.task_name, "train");
        assert_eq!(job.strategy, JobStrategy::RelaySequential);
        assert_eq!(job.targets.as_ref().map(Vec::len), Some(2));
        assert_eq!(job.data_kind, DataKind::Weights);
        assert_eq!(job.timeout(), Duration::from_secs(30));
        assert!(job.assignment_timeout().is_zero());
    }

    #[test]
    fn test_missing_job_folder() {
        assert!(parse_job_folder(Path::new("/nonexistent/job")).is_err());
    }

    #[test]
    fn test_simulate_features() {
        let toml = r#"
sites = 3

[[features]]
name = "x"
distribution = { type = "discrete", levels = 11 }
"#;
        let config: SimulateConfig = ::toml::from_str(toml).unwrap();
        assert_eq!(config.sites, 3);
        assert_eq!(config.rows_per_site, 200);
        assert_eq!(
            config.features[0].distribution,
            DistributionType::Discrete { levels: 11 }
        );
    }
}
