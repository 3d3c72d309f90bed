use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::runner::CommandRunner;

const RETRY_TIMES: u32 = 3;
const INCREASE_STEP: u16 = 7;

/// An established local-to-device forward, recorded so it can be removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forwarded {
    /// The local port that ended up bound.
    pub port: u16,
    /// Local side of the mapping, e.g. `tcp:15678`.
    pub local: String,
    /// Device side of the mapping, e.g. `ark:1234@com.example.worker`.
    pub target: String,
}

/// Port-forward manager over the bridge's `fport` commands.
pub struct Fport<R> {
    runner: R,
    retry_times: u32,
    increase_step: u16,
}

impl<R: CommandRunner> Fport<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            retry_times: RETRY_TIMES,
            increase_step: INCREASE_STEP,
        }
    }

    pub fn step(&self) -> u16 {
        self.increase_step
    }

    /// Forward a local port to the connect server of `pid`.
    pub async fn forward_connect_server(
        &self,
        port: u16,
        pid: u32,
        bundle_name: &str,
    ) -> Result<Forwarded, BridgeError> {
        self.forward(port, &format!("ark:{pid}@{bundle_name}")).await
    }

    /// Forward a local port to one instance's debugger server. `tid` 0 means
    /// the main thread.
    pub async fn forward_debugger_server(
        &self,
        port: u16,
        pid: u32,
        tid: u32,
    ) -> Result<Forwarded, BridgeError> {
        let target = if tid == 0 {
            format!("ark:{pid}@Debugger")
        } else {
            format!("ark:{pid}@{tid}@Debugger")
        };
        self.forward(port, &target).await
    }

    /// Try `tcp:<port> <target>`, advancing the candidate port by the fixed
    /// step on each rejected attempt. Exhausting the budget is fatal for the
    /// caller's connection attempt.
    async fn forward(&self, mut port: u16, target: &str) -> Result<Forwarded, BridgeError> {
        for _ in 0..self.retry_times {
            let local = format!("tcp:{port}");
            let output = self.runner.run(&["fport", &local, target]).await?;
            debug!("fport {local} {target}: {output}");
            if output == "Forwardport result:OK" {
                return Ok(Forwarded {
                    port,
                    local,
                    target: target.to_string(),
                });
            }
            // The port may be occupied
            port += self.increase_step;
        }
        Err(BridgeError::PortExhausted {
            target: target.to_string(),
            attempts: self.retry_times,
        })
    }

    /// Remove one mapping. Best-effort for callers: failure is an error they
    /// may log and ignore.
    pub async fn remove(&self, forwarded: &Forwarded) -> Result<(), BridgeError> {
        let output = self
            .runner
            .run(&["fport", "rm", &forwarded.local, &forwarded.target])
            .await?;
        debug!("fport rm {} {}: {output}", forwarded.local, forwarded.target);
        if output.contains("success") {
            Ok(())
        } else {
            Err(BridgeError::CommandFailed {
                cmd: format!("fport rm {} {}", forwarded.local, forwarded.target),
                output,
            })
        }
    }

    /// Remove every active `ark` forward left over from a previous run.
    ///
    /// `fport ls` output is line-oriented with entries introduced by
    /// `[Forward]`; each entry's mapping fields sit after a four-space
    /// separator.
    pub async fn clear_all(&self) -> Result<(), BridgeError> {
        let listing = self.runner.run(&["fport", "ls"]).await?;
        debug!("fport ls: {listing}");
        if listing.contains("Empty") {
            return Ok(());
        }
        for item in listing.split("[Forward]").filter(|item| item.contains("ark")) {
            let Some(fields) = item.split("    ").nth(1) else {
                warn!("unparseable fport entry: {item:?}");
                continue;
            };
            let mut words = fields.split(' ');
            let (Some(local), Some(target)) = (words.next(), words.next()) else {
                warn!("unparseable fport mapping: {fields:?}");
                continue;
            };
            let output = self.runner.run(&["fport", "rm", local, target]).await?;
            debug!("fport rm {local} {target}: {output}");
            if !output.contains("success") {
                return Err(BridgeError::CommandFailed {
                    cmd: format!("fport rm {local} {target}"),
                    output,
                });
            }
        }
        Ok(())
    }
}
