//! Scenario procedures: straight-line async scripts run under one
//! multiplexer session each.

mod debug_basic;
mod worker_profiler;

pub use debug_basic::debug_basic;
pub use worker_profiler::worker_profiler;
