//! Configuration validation

use super::*;
use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Validate complete server configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_server(&config.server)?;
    validate_pipeline(&config.pipeline)?;
    validate_quantile(&config.quantile)?;
    Ok(())
}

/// Validate listen addresses and the engine tick
pub fn validate_server(server: &ServerConfig) -> Result<()> {
    server
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address: {}", server.listen))?;
    server
        .admin_listen
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid admin_listen address: {}", server.admin_listen))?;
    if server.listen == server.admin_listen {
        anyhow::bail!("listen and admin_listen must differ, both are {}", server.listen);
    }
    if server.task_check_period_ms == 0 {
        anyhow::bail!("task_check_period_ms must be greater than 0");
    }
    Ok(())
}

/// Validate pipeline settings
pub fn validate_pipeline(pipeline: &PipelineConfig) -> Result<()> {
    if pipeline.min_sites == 0 {
        anyhow::bail!("min_sites must be at least 1");
    }
    if pipeline.min_responses > pipeline.min_sites {
        anyhow::bail!(
            "min_responses ({}) cannot exceed min_sites ({})",
            pipeline.min_responses,
            pipeline.min_sites
        );
    }
    if pipeline.histogram_bins == 0 || pipeline.histogram_bins > 10_000 {
        anyhow::bail!(
            "histogram_bins must be between 1 and 10000, got {}",
            pipeline.histogram_bins
        );
    }
    Ok(())
}

/// Validate median protocol settings
pub fn validate_quantile(quantile: &QuantileConfig) -> Result<()> {
    if quantile.enabled && quantile.max_rounds == 0 {
        anyhow::bail!("quantile.max_rounds must be at least 1");
    }
    Ok(())
}

/// Validate a simulation
pub fn validate_simulate(config: &SimulateConfig) -> Result<()> {
    if config.data_files.is_empty() {
        if config.sites == 0 {
            anyhow::bail!("sites must be at least 1");
        }
        if config.rows_per_site == 0 {
            anyhow::bail!("rows_per_site must be at least 1");
        }
        if config.features.is_empty() {
            anyhow::bail!("at least one feature is required");
        }
    }
    if !(0.0..1.0).contains(&config.missing_rate) {
        anyhow::bail!("missing_rate must be in [0.0, 1.0), got {}", config.missing_rate);
    }
    for (i, feature) in config.features.iter().enumerate() {
        if feature.name.is_empty() {
            anyhow::bail!("feature[{}] has an empty name", i);
        }
        validate_distribution(&feature.name, &feature.distribution)?;
    }
    validate_pipeline(&PipelineConfig {
        min_sites: config.site_count(),
        ..config.pipeline.clone()
    })?;
    validate_quantile(&config.quantile)?;
    Ok(())
}

fn validate_distribution(name: &str, dist: &DistributionType) -> Result<()> {
    match *dist {
        DistributionType::Uniform { low, high } if !(low < high) => {
            anyhow::bail!("feature '{}': uniform low ({}) must be below high ({})", name, low, high)
        }
        DistributionType::Normal { std_dev, .. } if !(std_dev > 0.0) => {
            anyhow::bail!("feature '{}': std_dev must be positive, got {}", name, std_dev)
        }
        DistributionType::LogNormal { sigma, .. } if !(sigma > 0.0) => {
            anyhow::bail!("feature '{}': sigma must be positive, got {}", name, sigma)
        }
        DistributionType::Discrete { levels } if levels == 0 => {
            anyhow::bail!("feature '{}': levels must be at least 1", name)
        }
        _ => Ok(()),
    }
}

/// Validate a job description
pub fn validate_job(job: &JobConfig) -> Result<()> {
    if job.task_name.trim().is_empty() {
        anyhow::bail!("job task_name must not be empty");
    }
    if let Some(ref targets) = job.targets {
        if targets.is_empty() {
            anyhow::bail!("job targets must not be an empty list");
        }
        if job.min_responses > targets.len() {
            anyhow::bail!(
                "min_responses ({}) exceeds number of targets ({})",
                job.min_responses,
                targets.len()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
        assert!(validate_simulate(&SimulateConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_server() {
        let mut server = ServerConfig::default();
        server.listen = "not-an-address".to_string();
        assert!(validate_server(&server).is_err());

        let mut server = ServerConfig::default();
        server.admin_listen = server.listen.clone();
        assert!(validate_server(&server).is_err());
    }

    #[test]
    fn test_invalid_pipeline() {
        let pipeline = PipelineConfig {
            min_sites: 2,
            min_responses: 3,
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline(&pipeline).is_err());

        let pipeline = PipelineConfig {
            histogram_bins: 0,
            ..PipelineConfig::default()
        };
        assert!(validate_pipeline(&pipeline).is_err());
    }

    #[test]
    fn test_invalid_distribution() {
        let mut config = SimulateConfig::default();
        config.features[0].distribution = DistributionType::Normal {
            mean: 0.0,
            std_dev: 0.0,
        };
        assert!(validate_simulate(&config).is_err());
    }

    #[test]
    fn test_job_validation() {
        let mut job = JobConfig {
            task_name: "train".to_string(),
            targets: Some(vec!["a".to_string()]),
            strategy: JobStrategy::Broadcast,
            min_responses: 2,
            grace_secs: 0,
            timeout_secs: 0,
            assignment_timeout_secs: 0,
            data_kind: DataKind::Weights,
            payload: None,
        };
        assert!(validate_job(&job).is_err());
        job.min_responses = 1;
        assert!(validate_job(&job).is_ok());
        job.targets = Some(Vec::new());
        assert!(validate_job(&job).is_err());
    }
}
