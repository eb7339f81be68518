//! fedctl CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use fedctl::config::cli::{AdminArgs, BroadcastArgs, Cli, Command, ServerArgs, SimulateArgs, SiteArgs};
use fedctl::config::toml::{
    merge_server_args, merge_simulate_args, parse_simulate_file, parse_toml_file,
    site_config_from_args,
};
use fedctl::config::validator::{validate_config, validate_simulate};
use fedctl::config::{Config, SimulateConfig};
use fedctl::connect::{
    send_request, AdminRequest, AdminResponse, AdminServer, BroadcastJob, ACTION_ABORT,
    ACTION_BROADCAST, ACTION_LIST_TASKS,
};
use fedctl::controller::{Controller, Signal};
use fedctl::distributed::{SiteServer, SiteService};
use fedctl::output::{json, text};
use fedctl::simulator::Simulator;
use fedctl::site::{Dataset, StatsExecutor};
use fedctl::util::time::format_duration;
use fedctl::StatsPipeline;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => {
            init_logging();
            run_server(args).await
        }
        Command::Site(args) => {
            init_logging();
            run_site(args).await
        }
        Command::Simulate(args) => {
            init_logging();
            run_simulate(args).await
        }
        Command::Broadcast(args) => {
            init_logging_simple();
            run_broadcast(args).await
        }
        Command::ListTasks(args) => {
            init_logging_simple();
            run_admin(&args, AdminRequest::new(ACTION_LIST_TASKS, serde_json::Value::Null)).await
        }
        Command::Abort(args) => {
            init_logging_simple();
            run_admin(&args, AdminRequest::new(ACTION_ABORT, serde_json::Value::Null)).await
        }
    }
}

/// Run the server: site listener, admin channel and (optionally) the pipeline
async fn run_server(args: ServerArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => parse_toml_file(path)?,
        None => Config::default(),
    };
    let config = merge_server_args(&args, config)?;
    validate_config(&config).context("Configuration validation failed")?;

    println!("fedctl v{}", env!("CARGO_PKG_VERSION"));
    println!("Site protocol: {}", config.server.listen);
    println!("Admin channel: {}", config.server.admin_listen);
    println!();

    let controller = Arc::new(Controller::new(config.server.task_check_period()));
    let abort = controller.abort_signal();

    let mut site_server = tokio::spawn(
        SiteServer::new(
            controller.clone(),
            config.server.listen.clone(),
            config.server.retry_after_ms,
        )
        .run(),
    );
    let mut admin_server = tokio::spawn(
        AdminServer::new(controller.clone(), config.server.admin_listen.clone()).run(),
    );
    spawn_abort_on_shutdown(abort.clone(), Some(controller.clone()));

    if !config.server.run_pipeline {
        info!("pipeline disabled, serving ad-hoc jobs");
        tokio::select! {
            served = &mut site_server => served.context("Site server task failed")??,
            served = &mut admin_server => served.context("Admin server task failed")??,
            _ = wait_for(abort.clone()) => info!("server stopped"),
        }
        return Ok(());
    }

    let started = Instant::now();
    let pipeline = {
        let controller = controller.clone();
        let pipeline_config = config.pipeline.clone();
        let quantile_config = config.quantile.clone();
        tokio::task::spawn_blocking(move || {
            StatsPipeline::new(&controller, &pipeline_config, &quantile_config).run()
        })
    };

    let stats = tokio::select! {
        joined = pipeline => joined.context("Pipeline thread panicked")??,
        served = &mut site_server => {
            abort.trigger();
            served.context("Site server task failed")??;
            anyhow::bail!("Site server stopped before the pipeline finished");
        }
        served = &mut admin_server => {
            abort.trigger();
            served.context("Admin server task failed")??;
            anyhow::bail!("Admin channel stopped before the pipeline finished");
        }
    };

    if let Some(path) = json::publish(&config.output, &stats)? {
        println!("Results written to {}", path.display());
    }
    text::print_results(&stats, started.elapsed(), &config.output);
    Ok(())
}

/// Run one site against a server until aborted or disconnected
async fn run_site(args: SiteArgs) -> Result<()> {
    let config = site_config_from_args(&args)?;
    let dataset = Dataset::from_csv_path(&config.data)?;
    let features = dataset.feature_names();
    println!(
        "Site {} serving {} ({} rows, {} features)",
        config.site_name(),
        config.data.display(),
        dataset.rows(),
        features.len()
    );

    let executor = StatsExecutor::new(dataset, config.seed);
    let service = SiteService::new(config, Box::new(executor), features);
    spawn_abort_on_shutdown(service.abort_signal(), None);

    let report = service.run().await?;
    println!(
        "Executed {} task(s), {} result(s) rejected",
        report.tasks_executed, report.results_rejected
    );
    Ok(())
}

/// Run the pipeline over in-process sites
async fn run_simulate(args: SimulateArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => parse_simulate_file(path)?,
        None => SimulateConfig::default(),
    };
    let config = merge_simulate_args(&args, config);
    validate_simulate(&config).context("Simulation configuration invalid")?;

    println!("fedctl v{}", env!("CARGO_PKG_VERSION"));
    println!("Simulating {} site(s)", config.site_count());
    if config.data_files.is_empty() {
        for feature in &config.features {
            println!("  {:<16} {}", feature.name, feature.distribution);
        }
    }
    println!();

    let output = config.output.clone();
    let simulator = Simulator::new(config);
    let report = tokio::task::spawn_blocking(move || simulator.run())
        .await
        .context("Simulator thread panicked")??;

    if let Some(path) = json::publish(&output, &report.stats)? {
        println!("Results written to {}", path.display());
    }
    text::print_results(&report.stats, report.elapsed, &output);
    for (site, tasks) in &report.site_tasks {
        println!("  {} executed {} task(s)", site, tasks);
    }
    println!("Simulation finished in {}", format_duration(report.elapsed));
    Ok(())
}

async fn run_broadcast(args: BroadcastArgs) -> Result<()> {
    let job = BroadcastJob::from_folder(&args.job_folder)?;
    println!(
        "Dispatching '{}' ({}, {} byte payload)",
        job.job.task_name,
        job.job.strategy,
        job.payload.len()
    );
    let parameters = serde_json::to_value(&job).context("Failed to encode job")?;
    let response = send_request(&args.admin, &AdminRequest::new(ACTION_BROADCAST, parameters)).await?;
    print_response(response)
}

async fn run_admin(args: &AdminArgs, request: AdminRequest) -> Result<()> {
    let response = send_request(&args.admin, &request).await?;
    print_response(response)
}

fn print_response(response: AdminResponse) -> Result<()> {
    if !response.is_ok() {
        anyhow::bail!(
            "Server refused request: {}",
            response.message.as_deref().unwrap_or("no reason given")
        );
    }
    let body = serde_json::to_string_pretty(&response.data).context("Failed to format response")?;
    println!("{}", body);
    Ok(())
}

/// Trigger the abort signal on Ctrl+C / SIGTERM
fn spawn_abort_on_shutdown(abort: Signal, controller: Option<Arc<Controller>>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown requested, aborting");
        abort.trigger();
        if let Some(controller) = controller {
            controller.cancel_all();
        }
    });
}

async fn wait_for(abort: Signal) {
    while !abort.triggered() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn init_logging_simple() {
    // admin commands only print the response
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
