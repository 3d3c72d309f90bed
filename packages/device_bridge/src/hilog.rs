use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::BridgeError;

/// Continuously drains the device log stream (`hdc shell hilog`) to a file.
///
/// This runs on a dedicated OS thread with a blocking child process, not on
/// the async runtime: the log stream must keep draining for the whole test
/// run regardless of what the multiplexer is doing.
pub struct HilogCapture {
    child: Child,
    writer: Option<JoinHandle<()>>,
}

impl HilogCapture {
    pub fn start(log_path: &Path) -> Result<Self, BridgeError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(log_path)?;

        let mut child = Command::new("hdc")
            .args(["shell", "hilog"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let Some(mut stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(BridgeError::CommandFailed {
                cmd: "shell hilog".into(),
                output: "no stdout pipe".into(),
            });
        };

        let path = log_path.to_path_buf();
        let writer = std::thread::spawn(move || match io::copy(&mut stdout, &mut file) {
            Ok(bytes) => debug!("hilog capture to {} ended after {bytes} bytes", path.display()),
            Err(e) => warn!("hilog capture to {} failed: {e}", path.display()),
        });

        Ok(Self {
            child,
            writer: Some(writer),
        })
    }

    /// Kill the log stream and wait for the writer thread to flush out.
    pub fn stop(mut self) {
        if let Err(e) = self.child.kill() {
            warn!("failed to kill hilog process: {e}");
        }
        let _ = self.child.wait();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for HilogCapture {
    fn drop(&mut self) {
        // stop() already reaped the child; this covers early-failure paths
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
