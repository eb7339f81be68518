//! CLI argument parsing using clap

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// fedctl - Federated control plane
#[derive(Parser, Debug)]
#[command(name = "fedctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server: site protocol, admin channel and statistics pipeline
    Server(ServerArgs),
    /// Run one site serving a local CSV file
    Site(SiteArgs),
    /// Run the statistics pipeline over in-process sites
    Simulate(SimulateArgs),
    /// Dispatch the job in a job folder through a running server
    Broadcast(BroadcastArgs),
    /// List standing tasks on a running server
    ListTasks(AdminArgs),
    /// Cancel every standing task on a running server
    Abort(AdminArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Site protocol listen address (e.g., 0.0.0.0:8002)
    #[arg(long)]
    pub listen: Option<String>,

    /// Admin channel listen address (e.g., 127.0.0.1:8003)
    #[arg(long)]
    pub admin_listen: Option<String>,

    /// Sites required before the pipeline starts
    #[arg(long)]
    pub min_sites: Option<usize>,

    /// Per-phase task timeout (e.g., 30s, 5m)
    #[arg(long)]
    pub task_timeout: Option<String>,

    /// Grace period after min_responses is reached (e.g., 5s)
    #[arg(long)]
    pub grace: Option<String>,

    /// Median protocol round cap
    #[arg(long)]
    pub max_rounds: Option<u32>,

    /// Pivot selection seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Serve ad-hoc jobs only; never run the statistics pipeline
    #[arg(long)]
    pub no_pipeline: bool,

    /// JSON artifact file or directory
    #[arg(long)]
    pub json_output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SiteArgs {
    /// Server site-protocol address
    #[arg(long, default_value = "127.0.0.1:8002")]
    pub server: String,

    /// Local CSV file
    #[arg(long)]
    pub data: PathBuf,

    /// Site name (defaults to the host name)
    #[arg(long)]
    pub name: Option<String>,

    /// Idle pull interval (e.g., 200ms, 1s)
    #[arg(long, default_value = "200ms")]
    pub poll_interval: String,

    /// Sampling seed
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// TOML simulation file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Number of simulated sites
    #[arg(long)]
    pub sites: Option<usize>,

    /// Rows generated per site
    #[arg(long)]
    pub rows: Option<usize>,

    /// Seed for data generation and pivot selection
    #[arg(long)]
    pub seed: Option<u64>,

    /// Per-site CSV files (one site per file)
    #[arg(long, value_delimiter = ',')]
    pub data: Vec<PathBuf>,

    /// Median protocol round cap
    #[arg(long)]
    pub max_rounds: Option<u32>,

    /// Number of histogram bins
    #[arg(long)]
    pub bins: Option<usize>,

    /// JSON artifact file or directory
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Print per-site summaries
    #[arg(long)]
    pub per_site: bool,

    /// Print histogram buckets
    #[arg(long)]
    pub show_histogram: bool,
}

#[derive(Args, Debug)]
pub struct BroadcastArgs {
    /// Folder containing job.toml
    #[arg(value_name = "JOB_FOLDER")]
    pub job_folder: PathBuf,

    /// Admin channel address
    #[arg(long, default_value = "127.0.0.1:8003")]
    pub admin: String,
}

#[derive(Args, Debug)]
pub struct AdminArgs {
    /// Admin channel address
    #[arg(long, default_value = "127.0.0.1:8003")]
    pub admin: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcast() {
        let cli = Cli::try_parse_from(["fedctl", "broadcast", "jobs/stats", "--admin", "h:1"]).unwrap();
        match cli.command {
            Command::Broadcast(args) => {
                assert_eq!(args.job_folder, PathBuf::from("jobs/stats"));
                assert_eq!(args.admin, "h:1");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_simulate_data_list() {
        let cli = Cli::try_parse_from(["fedctl", "simulate", "--data", "a.csv,b.csv", "--seed", "3"])
            .unwrap();
        match cli.command {
            Command::Simulate(args) => {
                assert_eq!(args.data.len(), 2);
                assert_eq!(args.seed, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_site_requires_data() {
        assert!(Cli::try_parse_from(["fedctl", "site"]).is_err());
    }
}
