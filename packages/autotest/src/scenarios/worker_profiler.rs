use std::sync::Arc;
use std::time::Duration;

use device_bridge::CommandRunner;
use inspector_mux::{ConnectMode, MuxError, ScenarioDriver};
use tracing::info;

use crate::api::{InspectorApi, SamplingInterval};

const PROFILING_WINDOW: Duration = Duration::from_secs(10);

/// CPU-profile two worker threads of an app started with `-p`: attach to the
/// main thread and the first two announced workers, sample both workers for
/// ten seconds, then collect the profiles and disconnect everything.
pub async fn worker_profiler<R: CommandRunner>(
    pid: u32,
    driver: Arc<ScenarioDriver<R>>,
) -> Result<(), MuxError> {
    let mut main = driver.connect_to_debugger_server(pid, ConnectMode::Main).await?;
    let mut first = driver.connect_to_debugger_server(pid, ConnectMode::Worker).await?;
    let mut second = driver.connect_to_debugger_server(pid, ConnectMode::Worker).await?;
    driver.stop_accepting_new_instances();
    let api = InspectorApi::new(&driver);

    for worker in [&mut first, &mut second] {
        api.call(worker, "Runtime.enable").await?;
        api.call_with_params(worker, "Profiler.setSamplingInterval", SamplingInterval { interval: 500 })
            .await?;
        api.call(worker, "Profiler.start").await?;
        // let the worker run; it was paused at the profiling breakpoint
        api.call(worker, "Debugger.disable").await?;
    }

    info!("profiling workers {} and {} for {PROFILING_WINDOW:?}", first.instance_id, second.instance_id);
    tokio::time::sleep(PROFILING_WINDOW).await;

    let profile = api.call(&mut first, "Profiler.stop").await?;
    info!("worker {} profile collected ({} bytes)", first.instance_id, profile.to_string().len());
    let profile = api.call(&mut second, "Profiler.stop").await?;
    info!("worker {} profile collected ({} bytes)", second.instance_id, profile.to_string().len());
    // -p started profiling the main thread at launch; stopping collects it
    let profile = api.call(&mut main, "Profiler.stop").await?;
    info!("main thread profile collected ({} bytes)", profile.to_string().len());

    driver.close_instance(&first);
    driver.close_instance(&second);
    driver.close_instance(&main);
    driver.close_connect_server();
    Ok(())
}
