use std::sync::Arc;

use device_bridge::CommandRunner;
use inspector_mux::{ConnectMode, MuxError, ScenarioDriver};
use tracing::info;

use crate::api::InspectorApi;

/// Basic main-thread debugging handshake against an app started with `-D`:
/// attach, enable the runtime and debugger domains, release the paused app,
/// then disable and disconnect.
pub async fn debug_basic<R: CommandRunner>(
    pid: u32,
    driver: Arc<ScenarioDriver<R>>,
) -> Result<(), MuxError> {
    let mut main = driver.connect_to_debugger_server(pid, ConnectMode::Main).await?;
    driver.stop_accepting_new_instances();
    let api = InspectorApi::new(&driver);

    api.call(&mut main, "Runtime.enable").await?;
    // Debugger.enable is followed by scriptParsed events for already-loaded sources
    api.call_counted(&mut main, "Debugger.enable", 2).await?;
    api.call(&mut main, "Runtime.runIfWaitingForDebugger").await?;
    info!("application released from the launch pause");
    api.call(&mut main, "Debugger.disable").await?;

    driver.close_instance(&main);
    driver.close_connect_server();
    Ok(())
}
