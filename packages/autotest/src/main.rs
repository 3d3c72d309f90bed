use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use device_bridge::{Application, HdcRunner, HilogCapture};
use inspector_mux::{MuxError, ScenarioDriver, run_session};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod api;
mod config;
mod scenarios;

use config::HarnessConfig;

#[derive(Parser)]
#[command(name = "arktest", about = "Debugger test harness for device applications")]
struct Cli {
    /// Path to the harness configuration file
    #[arg(long, global = true, default_value = "arktest.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Main-thread debugging handshake against an app launched with -D
    Debug,
    /// CPU profiling of two worker threads of an app launched with -p
    WorkerProfiler,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "arktest=debug,inspector_mux=debug,device_bridge=debug,info"
    } else {
        "arktest=info,inspector_mux=info,device_bridge=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Debug => run_scenario(&config, "debug", Some("-D"), scenarios::debug_basic).await,
        Commands::WorkerProfiler => {
            run_scenario(&config, "worker-profiler", Some("-p"), scenarios::worker_profiler).await
        }
    }
}

/// Launch the app in the requested start mode, capture the device log for the
/// whole run, execute the scenario under a multiplexer session, and clean the
/// app off the device afterwards whatever the outcome.
async fn run_scenario<F, Fut>(
    config: &HarnessConfig,
    name: &str,
    start_mode: Option<&str>,
    scenario: F,
) -> Result<()>
where
    F: FnOnce(u32, Arc<ScenarioDriver<HdcRunner>>) -> Fut,
    Fut: Future<Output = Result<(), MuxError>>,
{
    info!("running scenario {name} against {}", config.device.bundle_name);
    let app = Application::new(HdcRunner);
    let pid = app
        .launch(&config.device.bundle_name, &config.device.hap_path, start_mode)
        .await
        .context("failed to launch the application under test")?;
    info!("application launched with pid {pid}");

    let log_path = Path::new(&config.logs.dir).join(format!(
        "{name}-{}.hilog.txt",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let hilog = HilogCapture::start(&log_path).context("failed to start device log capture")?;

    let result = run_session(config.mux_config(pid), HdcRunner, |driver| scenario(pid, driver)).await;

    // Device cleanup runs even when the scenario failed
    if let Err(e) = app.stop(&config.device.bundle_name).await {
        warn!("failed to stop the application: {e}");
    }
    if let Err(e) = app.uninstall(&config.device.bundle_name).await {
        warn!("failed to uninstall the application: {e}");
    }
    hilog.stop();

    result.with_context(|| format!("scenario {name} failed"))?;
    info!("scenario {name} passed; device log at {}", log_path.display());
    Ok(())
}
