//! Device bridge - command channel to a connected device over the `hdc` CLI.
//!
//! This crate wraps everything the debugger test harness needs from the
//! device bridge: running bridge commands, establishing and tearing down
//! local-to-device port forwards, controlling the application under test,
//! and capturing the device log stream to disk.
//!
//! The multiplexer in `inspector_mux` only depends on the [`CommandRunner`]
//! seam and the [`Fport`] manager; everything else is used by the harness
//! binary around a test run.

mod application;
mod error;
mod fport;
mod hilog;
mod runner;

pub use application::Application;
pub use error::BridgeError;
pub use fport::{Forwarded, Fport};
pub use hilog::HilogCapture;
pub use runner::{CommandRunner, HdcRunner};
