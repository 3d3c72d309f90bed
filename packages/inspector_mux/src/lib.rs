//! Debugger-session multiplexer.
//!
//! Owns one WebSocket connection to a device's connect server, watches it for
//! instance lifecycle notifications (main thread and spawned workers), opens
//! one additional WebSocket per live instance to that instance's debugger
//! server, and exposes per-instance ordered send/receive queues to scenario
//! code written as straight-line async procedures.
//!
//! Per instance there is exactly one sender pump (drains the outbound queue
//! onto the socket) and one receiver pump (drains the socket into the inbound
//! queue); pump pairs for different instances run fully independently. The
//! protocol payloads themselves are opaque JSON - this crate is transport and
//! session plumbing only.

mod config;
mod connect;
mod driver;
mod error;
mod message;
mod pump;
mod registry;

pub use config::MuxConfig;
pub use driver::{ConnectMode, ScenarioDriver, run_session};
pub use error::MuxError;
pub use message::{ConnectFrame, Outbound};
pub use registry::{InstanceConnection, InstanceRegistry};
