use std::time::Duration;

use device_bridge::BridgeError;
use tokio_tungstenite::tungstenite;

/// Errors from the multiplexer.
///
/// Transport failures during session init (handshakes, port forwarding) and
/// every protocol-shape violation end the run; mid-session socket closures do
/// not surface here - they only end the affected pump pair.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("websocket transport error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Handshake retry budget exhausted on the connect server.
    #[error("failed to connect to the connect server after {attempts} attempts")]
    ConnectServerUnavailable { attempts: u32 },

    /// Handshake retry budget exhausted on one instance's debugger server.
    #[error("failed to connect to the debugger server of instance {instance_id} after {attempts} attempts")]
    DebuggerServerUnavailable { instance_id: u32, attempts: u32 },

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error("timed out after {after:?} waiting for {what}")]
    RecvTimeout { what: String, after: Duration },

    #[error("expected {expected} frame, got: {actual}")]
    UnexpectedFrame {
        expected: &'static str,
        actual: String,
    },

    /// An instance reported an identity that does not match the requested
    /// connection protocol (main / worker / hybrid).
    #[error("instance identity mismatch on {field}: expected {expected}, got {actual}")]
    IdentityMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("no live session for instance {0}")]
    InstanceNotAttached(u32),

    #[error("response id mismatch: expected {expected_id}, got: {actual}")]
    ResponseMismatch { expected_id: u32, actual: String },
}
