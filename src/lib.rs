//! Service Observability Toolkit
//!
//! Shared observability plumbing for long-running data-pipeline services:
//! per-service Prometheus registries with a scrape endpoint, request
//! correlation ids, success/failure instrumentation, cooperative shutdown
//! on SIGINT/SIGTERM, structured logging, and SQL identifier validation.
//!
//! # Architecture
//!
//! ```text
//! Instrumented ──▶ RegistryCache ──▶ ServiceMetricsRegistry ──▶ /metrics
//!      │                                                        /healthz
//!      └──▶ correlation id (task-local) ──▶ tracing records
//!
//! SIGINT/SIGTERM ──▶ TerminationCoordinator ◀── work loop polls
//! ```
//!
//! # Modules
//!
//! - [`correlation`] - Per-task correlation ids
//! - [`db`] - Identifier validation and query builders
//! - [`error`] - Error types
//! - [`instrument`] - Success/failure instrumentation wrapper
//! - [`logging`] - Logging setup
//! - [`metrics`] - Service registries, registry cache, exposition server
//! - [`shutdown`] - Termination coordinator

pub mod correlation;
pub mod db;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod metrics;
pub mod shutdown;

// Re-export commonly used types
pub use error::{Error, Result};
pub use instrument::{log_errors, log_errors_async, Instrumented};
pub use logging::{init_logging, LoggingConfig};
pub use metrics::{RegistryCache, RegistryOptions, ServiceMetricsRegistry};
pub use shutdown::{TerminationCoordinator, TerminationState};
