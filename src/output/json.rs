//! JSON artifact
//!
//! The pipeline publishes one JSON file per successful run. Nothing is
//! written when any phase fails.

use crate::config::OutputConfig;
use crate::pipeline::GlobalStats;
use crate::Result;
use anyhow::Context;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

/// Artifact path from the output settings
///
/// A directory (existing, or given with a trailing separator) gets
/// `<json_name>.json` appended.
pub fn resolve_output_path(config: &OutputConfig) -> Option<PathBuf> {
    let path = config.json_output.as_ref()?;
    let is_dir = path.is_dir() || path.to_string_lossy().ends_with(std::path::MAIN_SEPARATOR);
    if is_dir {
        Some(path.join(format!("{}.json", config.json_name)))
    } else {
        Some(path.clone())
    }
}

/// Write the artifact, creating parent directories as needed
pub fn write_json_output(output_path: &Path, stats: &GlobalStats) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
    }
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output: {}", output_path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), stats)
        .with_context(|| format!("Failed to write JSON output: {}", output_path.display()))?;
    info!(path = %output_path.display(), "global statistics written");
    Ok(())
}

/// Load a previously written artifact
pub fn read_json_output(path: &Path) -> Result<GlobalStats> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open JSON output: {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("Failed to parse JSON output: {}", path.display()))
}

/// Resolve the path from the settings and write; returns the path written
pub fn publish(config: &OutputConfig, stats: &GlobalStats) -> Result<Option<PathBuf>> {
    match resolve_output_path(config) {
        Some(path) => {
            write_json_output(&path, stats)?;
            Ok(Some(path))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{GlobalFeature, GlobalSummary};
    use std::collections::BTreeMap;

    fn stats() -> GlobalStats {
        let mut summary = GlobalSummary {
            rows: 4,
            ..Default::default()
        };
        summary.features.insert(
            "x".to_string(),
            GlobalFeature {
                count: 4,
                mean: 2.5,
                min: 1.0,
                max: 4.0,
                num_zeros: 0,
                missing: 0,
                site_medians: BTreeMap::new(),
            },
        );
        GlobalStats {
            created_at: chrono::Utc::now(),
            sites: vec!["a".to_string()],
            summary,
            per_site: BTreeMap::new(),
            dispersion: BTreeMap::new(),
            medians: [("x".to_string(), Some(2.0))].into_iter().collect(),
            median_rounds: 3,
            median_converged: true,
            histograms: BTreeMap::new(),
            dropped: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_directory_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = OutputConfig {
            json_output: Some(dir.path().to_path_buf()),
            ..OutputConfig::default()
        };
        assert_eq!(
            resolve_output_path(&config).unwrap(),
            dir.path().join("global_stats.json")
        );
        assert!(resolve_output_path(&OutputConfig::default()).is_none());
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.json");
        write_json_output(&path, &stats()).unwrap();

        let loaded = read_json_output(&path).unwrap();
        assert_eq!(loaded.summary.features["x"].mean, 2.5);
        assert_eq!(loaded.medians["x"], Some(2.0));
        assert_eq!(loaded.median_rounds, 3);
    }
}
