use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use device_bridge::{CommandRunner, Fport};
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::MuxConfig;
use crate::connect::{Session, connect_connect_server, connect_receiver_loop};
use crate::error::MuxError;
use crate::message::{ConnectFrame, Outbound};
use crate::pump::sender_pump;
use crate::registry::{InstanceConnection, InstanceRegistry};

/// Bound on draining tracked pump tasks at session exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which identity-verification protocol `connect_to_debugger_server` runs.
/// The three are mutually exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectMode {
    /// Main thread: announces itself after a `connected` nudge; instance id
    /// must be 0 and the thread id must equal the process pid.
    Main,
    /// Worker thread: announced spontaneously; instance id must be non-zero,
    /// thread id must differ from the pid, and the name carries the worker
    /// marker.
    Worker,
    /// Hybrid runtime: both instance id and thread id equal the pid.
    Hybrid,
}

const WORKER_MARKER: &str = "workerThread_";

fn check_eq(field: &'static str, expected: u32, actual: u32) -> Result<(), MuxError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MuxError::IdentityMismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

fn verify_identity(
    mode: ConnectMode,
    pid: u32,
    instance_id: u32,
    tid: u32,
    name: &str,
) -> Result<(), MuxError> {
    match mode {
        ConnectMode::Hybrid => {
            check_eq("instanceId", pid, instance_id)?;
            check_eq("tid", pid, tid)
        }
        ConnectMode::Main => {
            check_eq("instanceId", 0, instance_id)?;
            check_eq("tid", pid, tid)
        }
        ConnectMode::Worker => {
            if instance_id == 0 {
                return Err(MuxError::IdentityMismatch {
                    field: "instanceId",
                    expected: "non-zero".into(),
                    actual: instance_id.to_string(),
                });
            }
            if tid == pid {
                return Err(MuxError::IdentityMismatch {
                    field: "tid",
                    expected: format!("anything but {pid}"),
                    actual: tid.to_string(),
                });
            }
            if !name.contains(WORKER_MARKER) {
                return Err(MuxError::IdentityMismatch {
                    field: "name",
                    expected: format!("contains {WORKER_MARKER:?}"),
                    actual: name.to_string(),
                });
            }
            Ok(())
        }
    }
}

/// The test-facing facade over one multiplexer session.
///
/// Scenario procedures use it to bootstrap per-instance connections, to send
/// requests with minted message ids, and to receive frames in wire order.
pub struct ScenarioDriver<R> {
    session: Arc<Session<R>>,
    connect_tx: mpsc::UnboundedSender<Outbound>,
    connect_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    next_id: AtomicU32,
}

impl<R: CommandRunner> ScenarioDriver<R> {
    /// Mint a fresh request id; never reused within the session.
    pub fn next_message_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn stop_accepting_new_instances(&self) {
        self.session.registry.stop_accepting_new_instances();
    }

    pub async fn instance_attached(&self, instance_id: u32) -> bool {
        self.session.registry.is_attached(instance_id).await
    }

    pub fn send_to_connect_server(&self, value: serde_json::Value) -> Result<(), MuxError> {
        debug!("[==>] connect server send message: {value}");
        self.connect_tx
            .send(Outbound::Request(value))
            .map_err(|_| MuxError::ChannelClosed("connect server outbound"))
    }

    /// Enqueue the close sentinel for the connect-server channel. Safe to
    /// call more than once.
    pub fn close_connect_server(&self) {
        let _ = self.connect_tx.send(Outbound::Close);
    }

    /// Next frame from the connect server, in wire order.
    pub async fn recv_from_connect_server(&self) -> Result<String, MuxError> {
        let wait = self.session.config.recv_timeout;
        match timeout(wait, async { self.connect_rx.lock().await.recv().await }).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err(MuxError::ChannelClosed("connect server inbound")),
            Err(_) => Err(MuxError::RecvTimeout {
                what: "connect server message".into(),
                after: wait,
            }),
        }
    }

    async fn expect_add_instance(&self) -> Result<(u32, u32, String), MuxError> {
        let text = self.recv_from_connect_server().await?;
        match serde_json::from_str::<ConnectFrame>(&text) {
            Ok(ConnectFrame::AddInstance {
                instance_id,
                tid,
                name,
            }) => Ok((instance_id, tid, name)),
            _ => Err(MuxError::UnexpectedFrame {
                expected: "addInstance",
                actual: text,
            }),
        }
    }

    /// Next connect-server frame must announce an instance teardown.
    pub async fn expect_destroy_instance(&self) -> Result<u32, MuxError> {
        let text = self.recv_from_connect_server().await?;
        match serde_json::from_str::<ConnectFrame>(&text) {
            Ok(ConnectFrame::DestroyInstance { instance_id }) => Ok(instance_id),
            _ => Err(MuxError::UnexpectedFrame {
                expected: "destroyInstance",
                actual: text,
            }),
        }
    }

    /// Bootstrap a connection to the next instance's debugger server,
    /// verifying the announced identity against `mode`. Any mismatch is a
    /// hard failure for the run.
    pub async fn connect_to_debugger_server(
        &self,
        pid: u32,
        mode: ConnectMode,
    ) -> Result<InstanceConnection, MuxError> {
        if matches!(mode, ConnectMode::Main | ConnectMode::Hybrid) {
            self.send_to_connect_server(serde_json::to_value(ConnectFrame::Connected)?)?;
        }
        let (instance_id, tid, name) = self.expect_add_instance().await?;
        verify_identity(mode, pid, instance_id, tid, &name)?;

        let pending = self
            .session
            .registry
            .next_instance()
            .await
            .ok_or(MuxError::ChannelClosed("instance rendezvous"))?;
        let connection = self
            .session
            .registry
            .claim(pending)
            .await
            .ok_or(MuxError::InstanceNotAttached(pending))?;
        info!("connected to the debugger server of instance {pending}");
        Ok(connection)
    }

    pub fn send_to_instance(
        &self,
        connection: &InstanceConnection,
        value: serde_json::Value,
    ) -> Result<(), MuxError> {
        debug!("[==>] instance {} send message: {value}", connection.instance_id);
        connection
            .sender
            .send(Outbound::Request(value))
            .map_err(|_| MuxError::ChannelClosed("instance outbound"))
    }

    /// Enqueue the close sentinel for one instance. Safe after the pump is
    /// already gone.
    pub fn close_instance(&self, connection: &InstanceConnection) {
        let _ = connection.sender.send(Outbound::Close);
    }

    async fn recv_one(&self, connection: &mut InstanceConnection) -> Result<String, MuxError> {
        let wait = self.session.config.recv_timeout;
        match timeout(wait, connection.receiver.recv()).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err(MuxError::ChannelClosed("instance inbound")),
            Err(_) => Err(MuxError::RecvTimeout {
                what: format!("instance {} message", connection.instance_id),
                after: wait,
            }),
        }
    }

    /// Receive the next meaningful frame from one instance.
    ///
    /// Target attach/detach echoes are drained and logged without being
    /// surfaced. `counts` is the number of frames one request is expected to
    /// produce: frames beyond the first are drained with the short secondary
    /// timeout and counted for diagnostics only.
    pub async fn recv_from_instance(
        &self,
        connection: &mut InstanceConnection,
        counts: usize,
    ) -> Result<String, MuxError> {
        let instance_id = connection.instance_id;

        let mut first = self.recv_one(connection).await?;
        while first.contains("Target.att") || first.contains("Target.det") {
            debug!("[<==] instance {instance_id} DRAINED message: {first}");
            first = self.recv_one(connection).await?;
        }
        debug!("[<==] instance {instance_id} receive FIRST message: {first}");

        let mut extra = 0usize;
        for _ in 1..counts {
            match timeout(self.session.config.drain_timeout, connection.receiver.recv()).await {
                Ok(Some(msg)) => {
                    extra += 1;
                    debug!("[<==] instance {instance_id} counts DRAINED message: {msg}");
                }
                _ => break,
            }
        }
        if counts > 1 {
            debug!("instance {instance_id}: drained {extra} of {} expected extra frames", counts - 1);
        }
        Ok(first)
    }
}

/// Run one scenario under a full multiplexer session.
///
/// Opens the connect-server channel, then drives its sender pump, its
/// receiver loop, and the scenario procedure concurrently as one task group:
/// the first failure from any of the three ends the run and is returned.
/// Teardown is guaranteed - every live instance gets the close sentinel and
/// all tracked pump tasks are drained before this returns, whether the
/// scenario succeeded, failed an assertion, or lost its transport.
pub async fn run_session<R, F, Fut>(
    config: MuxConfig,
    runner: R,
    scenario: F,
) -> Result<(), MuxError>
where
    R: CommandRunner,
    F: FnOnce(Arc<ScenarioDriver<R>>) -> Fut,
    Fut: Future<Output = Result<(), MuxError>>,
{
    let session = Arc::new(Session {
        fport: Fport::new(runner),
        registry: InstanceRegistry::new(),
        tracker: TaskTracker::new(),
        config,
    });

    let stream = connect_connect_server(&session).await?;
    let (sink, stream) = stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let driver = Arc::new(ScenarioDriver {
        session: session.clone(),
        connect_tx: out_tx,
        connect_rx: Mutex::new(in_rx),
        next_id: AtomicU32::new(0),
    });

    let scenario_driver = driver.clone();
    let scenario_task = async move {
        let result = scenario(scenario_driver.clone()).await;
        // Guaranteed teardown: close every live pump and the connect channel
        // even when the procedure bailed out early.
        scenario_driver.session.registry.close_all().await;
        scenario_driver.close_connect_server();
        result
    };

    let result = tokio::try_join!(
        sender_pump(sink, out_rx, "connect server".to_string()),
        connect_receiver_loop(&session, stream, in_tx),
        scenario_task,
    )
    .map(|_| ());

    session.registry.close_all().await;
    session.tracker.close();
    if timeout(SHUTDOWN_TIMEOUT, session.tracker.wait()).await.is_err() {
        warn!("pump shutdown timed out; abandoning remaining pump tasks");
    }
    result
}
