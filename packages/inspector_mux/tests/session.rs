//! Session tests against a localhost mock device: one scripted connect
//! server plus echoing debugger servers, with the bridge CLI stubbed out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use device_bridge::{BridgeError, CommandRunner};
use futures::{SinkExt, StreamExt};
use inspector_mux::{ConnectMode, MuxConfig, MuxError, run_session};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

const PID: u32 = 1234;

/// Bridge stub: every forward binds on the first try, removals succeed,
/// nothing is listed as stale.
#[derive(Clone, Copy)]
struct OkRunner;

impl CommandRunner for OkRunner {
    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        Ok(match args {
            ["fport", "ls"] => "[Empty]".to_string(),
            ["fport", "rm", ..] => "Remove forward ruler success".to_string(),
            _ => "Forwardport result:OK".to_string(),
        })
    }
}

enum Step {
    /// Wait for a `connected` request, then send the frame.
    AwaitConnected(Value),
    Send(Value),
    Sleep(Duration),
}

fn spawn_connect_server(listener: TcpListener, script: Vec<Step>) {
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for step in script {
            match step {
                Step::AwaitConnected(reply) => {
                    loop {
                        match ws.next().await {
                            Some(Ok(Message::Text(text))) if text.as_str().contains("connected") => {
                                break;
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                            _ => {}
                        }
                    }
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
                Step::Send(frame) => {
                    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
                }
                Step::Sleep(duration) => tokio::time::sleep(duration).await,
            }
        }
        // Serve the close handshake
        while let Some(msg) = ws.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    });
}

#[derive(Clone, Default)]
struct DebuggerStats {
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
}

/// Debugger-server stand-in: echoes `{"id": <id>, "result": {}}` for every
/// request, optionally preceded by event frames pushed right after the
/// handshake.
fn spawn_debugger_server(listener: TcpListener, stats: DebuggerStats, events_on_connect: Vec<Value>) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            stats.accepted.fetch_add(1, Ordering::SeqCst);
            let stats = stats.clone();
            let events = events_on_connect.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                for event in events {
                    ws.send(Message::Text(event.to_string().into())).await.unwrap();
                }
                while let Some(msg) = ws.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let value: Value = serde_json::from_str(text.as_str()).unwrap();
                            let reply = json!({"id": value["id"], "result": {}});
                            stats.received.lock().await.push(value);
                            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                stats.closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
}

async fn bind_local() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Bind `n` listeners on consecutive ports, as the debugger port cursor
/// advances by one per successful attach.
async fn bind_consecutive(n: u16) -> (Vec<TcpListener>, u16) {
    'attempt: for _ in 0..16 {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = first.local_addr().unwrap().port();
        let mut listeners = vec![first];
        for offset in 1..n {
            match TcpListener::bind(("127.0.0.1", base + offset)).await {
                Ok(listener) => listeners.push(listener),
                Err(_) => continue 'attempt,
            }
        }
        return (listeners, base);
    }
    panic!("could not find {n} consecutive free ports");
}

fn config(connect_port: u16, debugger_port: u16) -> MuxConfig {
    let mut config = MuxConfig::new(PID, "com.example.worker");
    config.connect_server_port = connect_port;
    config.debugger_server_port = debugger_port;
    config.recv_timeout = Duration::from_secs(5);
    config
}

fn add_instance(instance_id: u32, tid: u32, name: &str) -> Value {
    json!({"type": "addInstance", "instanceId": instance_id, "tid": tid, "name": name})
}

fn destroy_instance(instance_id: u32) -> Value {
    json!({"type": "destroyInstance", "instanceId": instance_id})
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn main_instance_end_to_end() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    spawn_connect_server(
        connect_listener,
        vec![Step::AwaitConnected(add_instance(0, PID, "main"))],
    );
    let stats = DebuggerStats::default();
    spawn_debugger_server(debugger_listener, stats.clone(), vec![]);

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let mut main = driver.connect_to_debugger_server(PID, ConnectMode::Main).await?;
        assert_eq!(main.instance_id, 0);

        // Two requests queued back to back must hit the wire in order and
        // correlate by id.
        let first_id = driver.next_message_id();
        driver.send_to_instance(&main, json!({"id": first_id, "method": "Runtime.enable"}))?;
        let second_id = driver.next_message_id();
        driver.send_to_instance(&main, json!({"id": second_id, "method": "Debugger.enable"}))?;

        let reply: Value =
            serde_json::from_str(&driver.recv_from_instance(&mut main, 1).await?).unwrap();
        assert_eq!(reply["id"], first_id);
        let reply: Value =
            serde_json::from_str(&driver.recv_from_instance(&mut main, 1).await?).unwrap();
        assert_eq!(reply["id"], second_id);

        driver.close_instance(&main);
        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();

    let methods: Vec<String> = stats
        .received
        .lock()
        .await
        .iter()
        .map(|v| v["method"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(methods, vec!["Runtime.enable", "Debugger.enable"]);
    let closed = stats.closed.clone();
    wait_until("debugger socket close", move || {
        closed.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn target_echo_frames_are_drained() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    spawn_connect_server(
        connect_listener,
        vec![Step::AwaitConnected(add_instance(0, PID, "main"))],
    );
    let stats = DebuggerStats::default();
    spawn_debugger_server(
        debugger_listener,
        stats.clone(),
        vec![
            json!({"method": "Target.attachedToTarget", "params": {"targetInfo": {"targetId": "0"}}}),
            json!({"method": "Target.detachedFromTarget", "params": {"targetId": "0"}}),
        ],
    );

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let mut main = driver.connect_to_debugger_server(PID, ConnectMode::Main).await?;
        let id = driver.next_message_id();
        driver.send_to_instance(&main, json!({"id": id, "method": "Runtime.enable"}))?;
        // The two target echoes arrive first but must not be surfaced
        let reply: Value =
            serde_json::from_str(&driver.recv_from_instance(&mut main, 1).await?).unwrap();
        assert_eq!(reply["id"], id);
        driver.close_instance(&main);
        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn counted_receive_drains_extra_event_frames() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    spawn_connect_server(
        connect_listener,
        vec![Step::AwaitConnected(add_instance(0, PID, "main"))],
    );

    // Debugger server that follows every response with two event frames
    tokio::spawn(async move {
        let (stream, _) = debugger_listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let reply = json!({"id": value["id"], "result": {}});
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                    for seq in 0..2 {
                        let event = json!({
                            "method": "HeapProfiler.lastSeenObjectId",
                            "params": {"lastSeenObjectId": seq},
                        });
                        ws.send(Message::Text(event.to_string().into())).await.unwrap();
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let mut main = driver.connect_to_debugger_server(PID, ConnectMode::Main).await?;

        // Expect three extra frames while only two arrive: the correlated
        // response comes back first, the extras are drained, and the missing
        // third costs the short secondary timeout rather than the primary one
        let id = driver.next_message_id();
        driver.send_to_instance(&main, json!({"id": id, "method": "Profiler.start"}))?;
        let started = std::time::Instant::now();
        let reply: Value =
            serde_json::from_str(&driver.recv_from_instance(&mut main, 4).await?).unwrap();
        assert_eq!(reply["id"], id);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "secondary drain stalled for {:?}",
            started.elapsed()
        );

        // The queue is clean afterwards: the next receive is the next response
        let id = driver.next_message_id();
        driver.send_to_instance(&main, json!({"id": id, "method": "Profiler.stop"}))?;
        let reply: Value =
            serde_json::from_str(&driver.recv_from_instance(&mut main, 1).await?).unwrap();
        assert_eq!(reply["id"], id);

        driver.close_instance(&main);
        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unclaimed_instance_backlog_fails_the_run() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listeners, debugger_port) = bind_consecutive(3).await;
    spawn_connect_server(
        connect_listener,
        vec![
            Step::Send(add_instance(2, 5001, "workerThread_1")),
            Step::Send(add_instance(3, 5002, "workerThread_2")),
            Step::Send(add_instance(4, 5003, "workerThread_3")),
        ],
    );
    let stats = DebuggerStats::default();
    for listener in debugger_listeners {
        spawn_debugger_server(listener, stats.clone(), vec![]);
    }

    let mut config = config(connect_port, debugger_port);
    config.recv_timeout = Duration::from_millis(600);

    let result = run_session(config, OkRunner, |driver| async move {
        let worker = driver.connect_to_debugger_server(PID, ConnectMode::Worker).await?;
        assert_eq!(worker.instance_id, 2);
        // Stop taking announced instances; the rendezvous fills up and the
        // session must fail instead of hanging
        tokio::time::sleep(Duration::from_secs(30)).await;
        driver.close_connect_server();
        Ok(())
    })
    .await;

    assert!(matches!(result, Err(MuxError::RecvTimeout { .. })));
}

#[tokio::test]
async fn worker_lifecycle_attach_and_destroy() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    spawn_connect_server(
        connect_listener,
        vec![
            Step::Send(add_instance(2, 5678, "workerThread_1")),
            Step::Sleep(Duration::from_millis(500)),
            Step::Send(destroy_instance(2)),
        ],
    );
    let stats = DebuggerStats::default();
    spawn_debugger_server(debugger_listener, stats.clone(), vec![]);

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let worker = driver.connect_to_debugger_server(PID, ConnectMode::Worker).await?;
        assert_eq!(worker.instance_id, 2);
        assert!(driver.instance_attached(2).await);

        assert_eq!(driver.expect_destroy_instance().await?, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!driver.instance_attached(2).await);

        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();

    let closed = stats.closed.clone();
    wait_until("worker socket close", move || {
        closed.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn latch_stops_auto_attach_of_late_workers() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    spawn_connect_server(
        connect_listener,
        vec![
            Step::AwaitConnected(add_instance(0, PID, "main")),
            Step::Sleep(Duration::from_millis(300)),
            Step::Send(add_instance(2, 5678, "workerThread_1")),
        ],
    );
    let stats = DebuggerStats::default();
    spawn_debugger_server(debugger_listener, stats.clone(), vec![]);

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let main = driver.connect_to_debugger_server(PID, ConnectMode::Main).await?;
        driver.stop_accepting_new_instances();

        // The late worker is announced but gets no pump
        let text = driver.recv_from_connect_server().await?;
        assert!(text.contains("addInstance"), "unexpected frame: {text}");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!driver.instance_attached(2).await);

        driver.close_instance(&main);
        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(stats.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn worker_threshold_caps_auto_attach() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listeners, debugger_port) = bind_consecutive(3).await;
    spawn_connect_server(
        connect_listener,
        vec![
            Step::Send(add_instance(2, 5001, "workerThread_1")),
            Step::Send(add_instance(3, 5002, "workerThread_2")),
            Step::Send(add_instance(4, 5003, "workerThread_3")),
            Step::Send(add_instance(5, 5004, "workerThread_4")),
        ],
    );
    let stats = DebuggerStats::default();
    for listener in debugger_listeners {
        spawn_debugger_server(listener, stats.clone(), vec![]);
    }

    run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        let first = driver.connect_to_debugger_server(PID, ConnectMode::Worker).await?;
        let second = driver.connect_to_debugger_server(PID, ConnectMode::Worker).await?;
        let third = driver.connect_to_debugger_server(PID, ConnectMode::Worker).await?;
        assert_eq!(
            (first.instance_id, second.instance_id, third.instance_id),
            (2, 3, 4)
        );

        // The fourth worker is over the threshold: announced, not attached
        let text = driver.recv_from_connect_server().await?;
        assert!(text.contains("workerThread_4"), "unexpected frame: {text}");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!driver.instance_attached(5).await);

        driver.close_instance(&first);
        driver.close_instance(&second);
        driver.close_instance(&third);
        driver.close_connect_server();
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(stats.accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn main_identity_mismatch_fails_the_run() {
    let (connect_listener, connect_port) = bind_local().await;
    let (debugger_listener, debugger_port) = bind_local().await;
    // Device reports a non-zero instance id for what should be the main thread
    spawn_connect_server(
        connect_listener,
        vec![Step::AwaitConnected(add_instance(2, PID, "main"))],
    );
    spawn_debugger_server(debugger_listener, DebuggerStats::default(), vec![]);

    let result = run_session(config(connect_port, debugger_port), OkRunner, |driver| async move {
        driver.connect_to_debugger_server(PID, ConnectMode::Main).await?;
        Ok(())
    })
    .await;

    assert!(matches!(
        result,
        Err(MuxError::IdentityMismatch {
            field: "instanceId",
            ..
        })
    ));
}
