//! Rule scheduling
//!
//! This module provides:
//! - [`RunTracker`]: cadence due-computation against run records
//! - [`Dispatcher`]: HTTP client for the orchestrator endpoint with retry
//! - [`ScheduleFlow`]: the tick loop tying rules, dispatch and publishing together

mod dispatcher;
mod flow;
mod tracker;

pub use dispatcher::{
    build_request, AnalysisExecuter, DispatchError, Dispatcher, DispatcherBuilder,
    DispatcherConfig, RunnerExecuter, ANALYSIS_PATH,
};
pub use flow::{ScheduleFlow, SchedulerConfig, TickSummary, DEFAULT_TICK_INTERVAL};
pub use tracker::RunTracker;
