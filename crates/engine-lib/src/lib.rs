//! Detector execution and scheduling library
//!
//! This crate provides the core functionality for:
//! - Loading and validating detector packages
//! - Running detectors in process or in an isolated host process
//! - Turning raw detector output into canonical alerts
//! - Scheduling alert rules and dispatching them to the orchestrator
//! - Health checks and observability

pub mod detector;
pub mod health;
pub mod isolation;
pub mod loader;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod presentation;
pub mod scheduler;
pub mod storage;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};
pub use orchestrator::{AnalysisRunner, ExecutionOrchestrator, OrchestratorError};
pub use scheduler::{ScheduleFlow, TickSummary};
