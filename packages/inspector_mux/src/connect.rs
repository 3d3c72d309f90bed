use device_bridge::{CommandRunner, Fport};
use futures::StreamExt;
use futures::stream::SplitStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::message::ConnectFrame;
use crate::pump::{WsStream, open_debugger_server, spawn_pump_pair};
use crate::registry::InstanceRegistry;

/// Everything a session shares between the connect channel, the pumps it
/// spawns, and the scenario driver.
pub(crate) struct Session<R> {
    pub fport: Fport<R>,
    pub registry: InstanceRegistry,
    pub tracker: TaskTracker,
    pub config: MuxConfig,
}

/// Dial the device's connect server: clear stale forwards once, then
/// forward-and-handshake with the same advance-on-failure policy as the
/// debugger dials. Exhausting the budget is fatal - nothing works without
/// this channel.
pub(crate) async fn connect_connect_server<R: CommandRunner>(
    session: &Session<R>,
) -> Result<WsStream, MuxError> {
    let config = &session.config;
    session.fport.clear_all().await?;

    let mut port = config.connect_server_port;
    for _ in 0..config.connect_retries {
        let forwarded = session
            .fport
            .forward_connect_server(port, config.pid, &config.bundle_name)
            .await?;
        match connect_async(format!("ws://{}:{}", config.host, forwarded.port)).await {
            Ok((stream, _)) => {
                info!("connect server connected on port {}", forwarded.port);
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {}:{} failed: {e}", config.host, forwarded.port);
                if let Err(e) = session.fport.remove(&forwarded).await {
                    warn!("failed to remove stale forward {}: {e}", forwarded.local);
                }
                port = forwarded.port + session.fport.step();
            }
        }
    }
    Err(MuxError::ConnectServerUnavailable {
        attempts: config.connect_retries,
    })
}

/// Receive loop of the connect-server channel.
///
/// Every text frame is queued for the scenario driver; lifecycle frames are
/// additionally acted on here. An `addInstance` establishes the instance's
/// debugger-server pump pair *before* the loop resumes, so the pump exists
/// before any debugger traffic for that instance can arrive; the id is then
/// handed to the driver through the registry rendezvous. A `destroyInstance`
/// enqueues the close sentinel and drops the registry entry without waiting
/// for the pump to finish.
///
/// Socket closure ends the loop normally; failing to establish a pump for an
/// announced instance is fatal to the session.
pub(crate) async fn connect_receiver_loop<R: CommandRunner>(
    session: &Session<R>,
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<String>,
) -> Result<(), MuxError> {
    let config = &session.config;
    let mut debugger_port = config.debugger_server_port;
    let mut active_workers: u32 = 0;

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(frame)) => {
                debug!("connect server connection closed: {frame:?}");
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("connect server connection closed: {e}");
                return Ok(());
            }
        };

        debug!("[<==] connect server receive message: {text}");
        if inbound.send(text.clone()).is_err() {
            return Ok(());
        }

        match serde_json::from_str::<ConnectFrame>(&text) {
            Ok(ConnectFrame::AddInstance {
                instance_id,
                tid,
                name,
            }) => {
                let within_threshold =
                    instance_id == 0 || active_workers < config.worker_threshold;
                if !session.registry.is_accepting() || !within_threshold {
                    debug!("instance {instance_id} ({name}) announced but not auto-attached");
                    continue;
                }
                let Some(ends) = session.registry.attach(instance_id).await else {
                    continue;
                };
                let opened = open_debugger_server(
                    &session.fport,
                    &config.host,
                    debugger_port,
                    config.pid,
                    instance_id,
                    config.connect_retries,
                )
                .await;
                let (ws, bound) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        session.registry.detach(instance_id).await;
                        return Err(e);
                    }
                };
                info!("instance {instance_id} (tid {tid}, name {name:?}): debugger server connected on port {bound}");
                debugger_port = bound + 1;
                spawn_pump_pair(
                    &session.tracker,
                    ws,
                    ends,
                    format!("instance {instance_id}"),
                );
                if instance_id != 0 {
                    active_workers += 1;
                }
                // The rendezvous back-pressures this loop until the scenario
                // takes the previous instance; bound the wait so a scenario
                // that stopped taking instances fails the run instead of
                // hanging it.
                match timeout(
                    config.recv_timeout,
                    session.registry.publish_instance(instance_id),
                )
                .await
                {
                    Ok(published) => published?,
                    Err(_) => {
                        return Err(MuxError::RecvTimeout {
                            what: format!("the scenario to take over instance {instance_id}"),
                            after: config.recv_timeout,
                        });
                    }
                }
            }
            Ok(ConnectFrame::DestroyInstance { instance_id }) => {
                session.registry.close_instance(instance_id).await;
                session.registry.detach(instance_id).await;
                if instance_id != 0 {
                    active_workers = active_workers.saturating_sub(1);
                }
            }
            // `connected` echoes and opaque frames stay queued for the driver
            _ => {}
        }
    }
    Ok(())
}
