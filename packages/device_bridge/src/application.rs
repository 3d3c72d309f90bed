use std::time::Duration;

use tracing::info;

use crate::error::BridgeError;
use crate::runner::CommandRunner;

/// How long the application gets to finish launching before the pid lookup.
const LAUNCH_SETTLE: Duration = Duration::from_secs(3);

/// Lifecycle control for the application under test.
pub struct Application<R> {
    runner: R,
}

impl<R: CommandRunner> Application<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub async fn stop(&self, bundle_name: &str) -> Result<(), BridgeError> {
        info!("force stop application: {bundle_name}");
        self.runner
            .run(&["shell", "aa", "force-stop", bundle_name])
            .await?;
        Ok(())
    }

    pub async fn uninstall(&self, bundle_name: &str) -> Result<(), BridgeError> {
        info!("uninstall application: {bundle_name}");
        self.runner.run(&["uninstall", bundle_name]).await?;
        Ok(())
    }

    pub async fn install(&self, hap_path: &str) -> Result<(), BridgeError> {
        info!("install application: {hap_path}");
        let output = self.runner.run(&["install", "-r", hap_path]).await?;
        if output.contains("successfully") {
            Ok(())
        } else {
            Err(BridgeError::CommandFailed {
                cmd: format!("install -r {hap_path}"),
                output,
            })
        }
    }

    /// Start the entry ability, optionally with a start mode such as `-D`
    /// (wait for debugger) or `-p` (profiling).
    pub async fn start(&self, bundle_name: &str, start_mode: Option<&str>) -> Result<(), BridgeError> {
        let mut args = vec!["shell", "aa", "start", "-a", "EntryAbility", "-b", bundle_name];
        if let Some(mode) = start_mode {
            args.push(mode);
        }
        info!("start application: {}", args.join(" "));
        let output = self.runner.run(&args).await?;
        if output == "start ability successfully." {
            Ok(())
        } else {
            Err(BridgeError::CommandFailed {
                cmd: args.join(" "),
                output,
            })
        }
    }

    /// Pid of the bundle's process, from the second column of `ps -ef`.
    pub async fn get_pid(&self, bundle_name: &str) -> Result<u32, BridgeError> {
        let output = self.runner.run(&["shell", "ps", "-ef"]).await?;
        for line in output.lines() {
            if line.contains(bundle_name) {
                info!("pid of {bundle_name}: {}", line.trim());
                if let Some(pid) = line.split_whitespace().nth(1).and_then(|f| f.parse().ok()) {
                    if pid != 0 {
                        return Ok(pid);
                    }
                }
            }
        }
        Err(BridgeError::PidNotFound(bundle_name.to_string()))
    }

    /// Full relaunch: stop, uninstall, install, start, settle, pid lookup.
    pub async fn launch(
        &self,
        bundle_name: &str,
        hap_path: &str,
        start_mode: Option<&str>,
    ) -> Result<u32, BridgeError> {
        self.stop(bundle_name).await?;
        self.uninstall(bundle_name).await?;
        self.install(hap_path).await?;
        self.start(bundle_name, start_mode).await?;
        tokio::time::sleep(LAUNCH_SETTLE).await;
        self.get_pid(bundle_name).await
    }
}
