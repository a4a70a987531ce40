//! Metrics module
//!
//! Per-service Prometheus registries, their exposition servers, and the
//! process-scoped cache that keeps one registry per service name.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       RegistryCache                           │
//! │   service name ──▶ ServiceMetricsRegistry                     │
//! │                      ├── prometheus::Registry (sink)          │
//! │                      ├── built-in instruments                 │
//! │                      └── exposition server (/metrics)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod cache;
mod registry;
mod server;

pub use cache::RegistryCache;
pub use registry::{
    bind_first_available, resolve_port, LabelExtractor, RegistryOptions, ServiceMetricsRegistry,
    DEFAULT_METRICS_PORT, DEFAULT_SERVICE_VERSION, METRICS_PORT_ENV, PORT_PROBE_ATTEMPTS,
};

// =============================================================================
// Histogram Bucket Presets
// =============================================================================

/// Buckets for latencies measured in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Buckets for payload sizes in bytes.
pub const SIZE_BUCKETS: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0, 16777216.0,
];

/// Buckets for item counts (batch sizes, queue depths).
pub const COUNT_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];
