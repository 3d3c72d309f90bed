use device_bridge::{CommandRunner, Fport};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::MuxError;
use crate::message::Outbound;
use crate::registry::PumpEnds;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drain an outbound queue onto a socket. Frames go out in enqueue order;
/// the close sentinel sends a close frame and ends the pump. Queue closure
/// without a sentinel ends the pump too (session teardown already happened).
pub(crate) async fn sender_pump(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    label: String,
) -> Result<(), MuxError> {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Request(value) => {
                let json = serde_json::to_string(&value)?;
                sink.send(Message::Text(json.into())).await?;
            }
            Outbound::Close => {
                debug!("{label}: closing connection");
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Drain a socket into an inbound queue, preserving arrival order. Transport
/// errors and closure are terminal for this pump only - the instance is
/// presumed destroyed or torn down device-side.
pub(crate) async fn receiver_pump(
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<String>,
    label: String,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if inbound.send(text.to_string()).is_err() {
                    debug!("{label}: inbound queue dropped");
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!("{label}: connection closed: {frame:?}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{label}: connection closed: {e}");
                break;
            }
        }
    }
}

/// Dial one instance's debugger server: forward a local port (advancing past
/// occupied candidates), then attempt the WebSocket handshake; a failed
/// handshake removes the mapping and retries on the next candidate port.
/// Returns the connected stream and the port that ended up bound.
pub(crate) async fn open_debugger_server<R: CommandRunner>(
    fport: &Fport<R>,
    host: &str,
    mut port: u16,
    pid: u32,
    instance_id: u32,
    retries: u32,
) -> Result<(WsStream, u16), MuxError> {
    for _ in 0..retries {
        let forwarded = fport.forward_debugger_server(port, pid, instance_id).await?;
        match connect_async(format!("ws://{host}:{}", forwarded.port)).await {
            Ok((stream, _)) => return Ok((stream, forwarded.port)),
            Err(e) => {
                debug!("connect to {host}:{} failed: {e}", forwarded.port);
                if let Err(e) = fport.remove(&forwarded).await {
                    warn!("failed to remove stale forward {}: {e}", forwarded.local);
                }
                port = forwarded.port + fport.step();
            }
        }
    }
    Err(MuxError::DebuggerServerUnavailable {
        instance_id,
        attempts: retries,
    })
}

/// Spawn the sender/receiver pump pair for one connected socket on the
/// session's task tracker. Each pair runs independently of every other.
pub(crate) fn spawn_pump_pair(tracker: &TaskTracker, stream: WsStream, ends: PumpEnds, label: String) {
    let (sink, stream) = stream.split();
    let sender_label = label.clone();
    tracker.spawn(async move {
        if let Err(e) = sender_pump(sink, ends.outbound, sender_label.clone()).await {
            warn!("{sender_label}: sender pump failed: {e}");
        }
    });
    tracker.spawn(receiver_pump(stream, ends.inbound, label));
}
