use std::io;

/// Errors from the device command channel.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Could not spawn or talk to the bridge CLI process.
    #[error("failed to run device command: {0}")]
    Io(#[from] io::Error),

    /// The bridge CLI ran but did not report success.
    #[error("device command `{cmd}` failed: {output}")]
    CommandFailed { cmd: String, output: String },

    /// Every candidate local port was rejected for a forward target.
    #[error("no usable port for forward target `{target}` after {attempts} attempts")]
    PortExhausted { target: String, attempts: u32 },

    /// `ps -ef` had no entry for the bundle.
    #[error("no running process found for bundle `{0}`")]
    PidNotFound(String),
}
