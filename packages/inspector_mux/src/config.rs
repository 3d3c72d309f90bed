use std::time::Duration;

/// Session configuration, owned by the multiplexer for the whole run.
///
/// The two port fields are starting candidates: the connect channel and every
/// debugger-server attach advance from them when a port turns out to be
/// occupied, and each successful attach moves the debugger cursor past the
/// port it consumed.
#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Host the forwarded ports are reachable on.
    pub host: String,
    /// First candidate local port for the connect-server forward.
    pub connect_server_port: u16,
    /// First candidate local port for debugger-server forwards.
    pub debugger_server_port: u16,
    pub bundle_name: String,
    /// Pid of the application under test.
    pub pid: u32,
    /// Handshake retry budget for connect-server and debugger-server dials.
    pub connect_retries: u32,
    /// Cap on concurrently auto-attached worker instances. The main thread
    /// (instance 0) is never counted against it.
    pub worker_threshold: u32,
    /// Primary wait for an expected message - a real device interaction.
    pub recv_timeout: Duration,
    /// Secondary wait when draining already-buffered extra frames.
    pub drain_timeout: Duration,
}

impl MuxConfig {
    pub fn new(pid: u32, bundle_name: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            connect_server_port: 15678,
            debugger_server_port: 15679,
            bundle_name: bundle_name.into(),
            pid,
            connect_retries: 3,
            worker_threshold: 3,
            recv_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_millis(300),
        }
    }
}
