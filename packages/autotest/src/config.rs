use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use inspector_mux::MuxConfig;
use serde::{Deserialize, Serialize};

// Three equivalent ways to configure:
//
//   arktest.toml:    [device]
//                    bundle_name = "com.example.myapplication"
//
//   env var:         ARKTEST_DEVICE__BUNDLE_NAME=...   (double underscore = nesting)
//
//   defaults:        the struct defaults below

/// Harness configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logs: LogConfig,
}

/// The application under test (lives under `[device]` in arktest.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_bundle_name")]
    pub bundle_name: String,
    /// Package to install before each run.
    #[serde(default = "default_hap_path")]
    pub hap_path: String,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bundle_name: default_bundle_name(),
            hap_path: default_hap_path(),
            host: default_host(),
        }
    }
}

/// First candidate local ports for the device forwards (`[ports]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_connect_server_port")]
    pub connect_server: u16,
    #[serde(default = "default_debugger_server_port")]
    pub debugger_server: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            connect_server: default_connect_server_port(),
            debugger_server: default_debugger_server_port(),
        }
    }
}

/// Session receive timeouts (`[timeouts]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Primary wait for an expected message, in seconds.
    #[serde(default = "default_recv_secs")]
    pub recv_secs: u64,
    /// Secondary wait when draining extra frames, in milliseconds.
    #[serde(default = "default_drain_millis")]
    pub drain_millis: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            recv_secs: default_recv_secs(),
            drain_millis: default_drain_millis(),
        }
    }
}

/// Where captured device logs land (`[logs]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

fn default_bundle_name() -> String {
    "com.example.myapplication".to_string()
}

fn default_hap_path() -> String {
    "MyApplicationWorker.hap".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connect_server_port() -> u16 {
    15678
}

fn default_debugger_server_port() -> u16 {
    15679
}

fn default_recv_secs() -> u64 {
    60
}

fn default_drain_millis() -> u64 {
    300
}

fn default_log_dir() -> String {
    "reports".to_string()
}

/// Layers: struct defaults → toml file → ARKTEST_* env vars.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(HarnessConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("ARKTEST_").split("__"))
        .extract()
        .context("invalid harness configuration")
}

impl HarnessConfig {
    /// Session configuration for a launched application process.
    pub fn mux_config(&self, pid: u32) -> MuxConfig {
        let mut config = MuxConfig::new(pid, &self.device.bundle_name);
        config.host = self.device.host.clone();
        config.connect_server_port = self.ports.connect_server;
        config.debugger_server_port = self.ports.debugger_server;
        config.recv_timeout = Duration::from_secs(self.timeouts.recv_secs);
        config.drain_timeout = Duration::from_millis(self.timeouts.drain_millis);
        config
    }
}
