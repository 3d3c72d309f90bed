use std::future::Future;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::BridgeError;

/// Executes one device-bridge command and returns its trimmed textual output.
///
/// The harness never shells out anywhere else; substituting this seam is how
/// tests run the whole stack without a device attached.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(&self, args: &[&str]) -> impl Future<Output = Result<String, BridgeError>> + Send;
}

/// The real bridge: `hdc <args...>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HdcRunner;

impl CommandRunner for HdcRunner {
    async fn run(&self, args: &[&str]) -> Result<String, BridgeError> {
        debug!("hdc {}", args.join(" "));
        let output = Command::new("hdc")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        let mut text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            // hdc reports some failures only on stderr
            text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        debug!("hdc output: {text}");
        Ok(text)
    }
}
