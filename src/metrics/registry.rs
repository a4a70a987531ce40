//! Service Metrics Registry
//!
//! Owns one Prometheus registry per service together with the built-in
//! service instruments and the lifecycle of its exposition server.

use std::collections::BTreeMap;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use tracing::{debug, info, warn};

use super::server::{self, ExpositionState, ServerHandle};
use crate::error::{Error, Result};

/// Port used when nothing else selects one.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Environment variable overriding the default port resolution.
pub const METRICS_PORT_ENV: &str = "METRICS_PORT";

/// Number of consecutive ports tried before giving up.
pub const PORT_PROBE_ATTEMPTS: u16 = 100;

/// Version reported by `service_info` unless configured otherwise.
pub const DEFAULT_SERVICE_VERSION: &str = "1.0.0";

/// Maps a service name to the common labels attached to `service_info`.
pub type LabelExtractor = Arc<dyn Fn(&str) -> BTreeMap<String, String> + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Options for a service registry
#[derive(Clone)]
pub struct RegistryOptions {
    /// Preferred exposition port
    pub port: Option<u16>,

    /// Ordered (service-name substring, port) table
    pub port_mapping: Vec<(String, u16)>,

    /// Address the exposition server binds to
    pub bind_host: String,

    /// Version reported by `service_info`
    pub version: String,

    /// Common label extractor (defaults to `{service: <name>}`)
    pub label_extractor: Option<LabelExtractor>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            port: None,
            port_mapping: Vec::new(),
            bind_host: "0.0.0.0".to_string(),
            version: DEFAULT_SERVICE_VERSION.to_string(),
            label_extractor: None,
        }
    }
}

impl RegistryOptions {
    /// Set the preferred port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Add an entry to the port table.
    pub fn with_port_mapping(mut self, key: impl Into<String>, port: u16) -> Self {
        self.port_mapping.push((key.into(), port));
        self
    }

    /// Set the bind address.
    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set a custom label extractor.
    pub fn with_label_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&str) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.label_extractor = Some(Arc::new(extractor));
        self
    }
}

impl std::fmt::Debug for RegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryOptions")
            .field("port", &self.port)
            .field("port_mapping", &self.port_mapping)
            .field("bind_host", &self.bind_host)
            .field("version", &self.version)
            .field("label_extractor", &self.label_extractor.is_some())
            .finish()
    }
}

fn default_labels(service_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("service".to_string(), service_name.to_string())])
}

// =============================================================================
// Port Resolution
// =============================================================================

/// Resolve the exposition port.
///
/// Priority: explicit port, then `env_value` (the `METRICS_PORT` override),
/// then the first `port_mapping` key contained in `service_name`, then
/// [`DEFAULT_METRICS_PORT`].
pub fn resolve_port(
    explicit: Option<u16>,
    env_value: Option<&str>,
    service_name: &str,
    port_mapping: &[(String, u16)],
) -> Result<u16> {
    if let Some(port) = explicit {
        return Ok(port);
    }

    if let Some(raw) = env_value.map(str::trim).filter(|raw| !raw.is_empty()) {
        return raw.parse::<u16>().map_err(|e| {
            Error::Config(format!("invalid {} value '{}': {}", METRICS_PORT_ENV, raw, e))
        });
    }

    Ok(port_mapping
        .iter()
        .find(|(key, _)| service_name.contains(key.as_str()))
        .map(|(_, port)| *port)
        .unwrap_or(DEFAULT_METRICS_PORT))
}

/// Try `bind` on up to `attempts` consecutive ports starting at `start`.
///
/// Ports refused with `AddrInUse` or `PermissionDenied` are skipped; any
/// other bind error is returned as is.
pub fn bind_first_available<T, F>(start: u16, attempts: u16, mut bind: F) -> Result<(u16, T)>
where
    F: FnMut(u16) -> io::Result<T>,
{
    for offset in 0..attempts {
        let Some(port) = start.checked_add(offset) else {
            break;
        };

        match bind(port) {
            Ok(bound) => return Ok((port, bound)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!(port, "Port not available: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(Error::PortExhausted { start, attempts })
}

// =============================================================================
// Registry
// =============================================================================

/// Metrics registry for a single service.
pub struct ServiceMetricsRegistry {
    service_name: String,
    options: RegistryOptions,
    registry: Registry,
    common_labels: BTreeMap<String, String>,
    errors_total: CounterVec,
    health_status: IntGauge,
    start_time: Gauge,
    counters: DashMap<String, CounterVec>,
    server: Mutex<Option<ServerHandle>>,
}

impl ServiceMetricsRegistry {
    /// Create a registry and its built-in instruments. No port is bound.
    pub fn new(service_name: impl Into<String>, options: RegistryOptions) -> Result<Self> {
        let service_name = service_name.into();
        let registry = Registry::new();
        let common_labels = match &options.label_extractor {
            Some(extract) => extract(&service_name),
            None => default_labels(&service_name),
        };

        let mut info_labels = BTreeMap::new();
        info_labels.insert("service_name".to_string(), service_name.clone());
        info_labels.insert("version".to_string(), options.version.clone());
        info_labels.extend(common_labels.clone());

        let label_names: Vec<&str> = info_labels.keys().map(String::as_str).collect();
        let label_values: Vec<&str> = info_labels.values().map(String::as_str).collect();
        let service_info = IntGaugeVec::new(
            Opts::new("service_info", "Service information"),
            &label_names,
        )?;
        registry.register(Box::new(service_info.clone()))?;
        service_info.get_metric_with_label_values(&label_values)?.set(1);

        let start_time = Gauge::with_opts(Opts::new(
            "service_start_time_seconds",
            "Service start time in Unix timestamp",
        ))?;
        registry.register(Box::new(start_time.clone()))?;
        start_time.set(Utc::now().timestamp_millis() as f64 / 1000.0);

        let errors_total = CounterVec::new(
            Opts::new("service_errors_total", "Total number of errors by type"),
            &["error_type", "component"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let health_status = IntGauge::with_opts(Opts::new(
            "service_health_status",
            "Service health status (1=healthy, 0=unhealthy)",
        ))?;
        registry.register(Box::new(health_status.clone()))?;
        health_status.set(1);

        Ok(Self {
            service_name,
            options,
            registry,
            common_labels,
            errors_total,
            health_status,
            start_time,
            counters: DashMap::new(),
            server: Mutex::new(None),
        })
    }

    /// Service name this registry belongs to
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Labels produced by the label extractor
    pub fn common_labels(&self) -> &BTreeMap<String, String> {
        &self.common_labels
    }

    /// Underlying Prometheus registry
    pub fn sink(&self) -> &Registry {
        &self.registry
    }

    // =========================================================================
    // Instrument Creation
    // =========================================================================

    /// Create and register a counter.
    ///
    /// Registering a name twice returns the sink's `AlreadyReg` error.
    pub fn create_counter(
        &self,
        name: &str,
        description: &str,
        label_names: &[&str],
    ) -> Result<CounterVec> {
        let counter = CounterVec::new(Opts::new(name, description), label_names)?;
        self.registry.register(Box::new(counter.clone()))?;
        self.counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }

    /// Return the counter registered under `name`, creating it if needed.
    pub fn counter_or_create(
        &self,
        name: &str,
        description: &str,
        label_names: &[&str],
    ) -> Result<CounterVec> {
        if let Some(counter) = self.counters.get(name) {
            return Ok(counter.clone());
        }

        match self.counters.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let counter = CounterVec::new(Opts::new(name, description), label_names)?;
                self.registry.register(Box::new(counter.clone()))?;
                slot.insert(counter.clone());
                Ok(counter)
            }
        }
    }

    /// Counter previously created through this registry
    pub fn counter(&self, name: &str) -> Option<CounterVec> {
        self.counters.get(name).map(|c| c.clone())
    }

    /// Create and register a gauge.
    pub fn create_gauge(
        &self,
        name: &str,
        description: &str,
        label_names: &[&str],
    ) -> Result<GaugeVec> {
        let gauge = GaugeVec::new(Opts::new(name, description), label_names)?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    /// Create and register a histogram, with the sink's default buckets
    /// unless `buckets` is given.
    pub fn create_histogram(
        &self,
        name: &str,
        description: &str,
        label_names: &[&str],
        buckets: Option<&[f64]>,
    ) -> Result<HistogramVec> {
        let mut opts = HistogramOpts::new(name, description);
        if let Some(buckets) = buckets {
            opts = opts.buckets(buckets.to_vec());
        }
        let histogram = HistogramVec::new(opts, label_names)?;
        self.registry.register(Box::new(histogram.clone()))?;
        Ok(histogram)
    }

    // =========================================================================
    // Built-in Signals
    // =========================================================================

    /// Increment `service_errors_total{error_type, component}`.
    pub fn record_error(&self, error_type: &str, component: &str) {
        self.errors_total
            .with_label_values(&[error_type, component])
            .inc();
    }

    /// Current value of `service_errors_total{error_type, component}`
    pub fn error_count(&self, error_type: &str, component: &str) -> f64 {
        self.errors_total
            .with_label_values(&[error_type, component])
            .get()
    }

    /// Set `service_health_status` to 1 (healthy) or 0.
    pub fn set_health(&self, healthy: bool) {
        self.health_status.set(i64::from(healthy));
    }

    /// Whether the health gauge currently reads 1
    pub fn is_healthy(&self) -> bool {
        self.health_status.get() == 1
    }

    /// Unix timestamp recorded at construction
    pub fn start_time_seconds(&self) -> f64 {
        self.start_time.get()
    }

    /// Render all instruments in the text exposition format.
    pub fn metrics_text(&self) -> Result<String> {
        server::render(&self.registry)
    }

    // =========================================================================
    // Exposition Server
    // =========================================================================

    /// Bound exposition port, if the server is running
    pub fn port(&self) -> Option<u16> {
        self.server.lock().as_ref().map(ServerHandle::port)
    }

    /// Whether an exposition server is running
    pub fn is_server_running(&self) -> bool {
        self.server.lock().is_some()
    }

    /// Start the exposition server and return the bound port.
    ///
    /// Idempotent: a running server is left alone and its port returned.
    /// Blocks while probing for a free port and must be called from within
    /// a tokio runtime.
    pub fn start_server(&self, port: Option<u16>) -> Result<u16> {
        let mut server = self.server.lock();
        if let Some(running) = server.as_ref() {
            warn!(
                service = %self.service_name,
                port = running.port(),
                "Metrics server already running"
            );
            return Ok(running.port());
        }

        let env_port = std::env::var(METRICS_PORT_ENV).ok();
        let target = resolve_port(
            port.or(self.options.port),
            env_port.as_deref(),
            &self.service_name,
            &self.options.port_mapping,
        )?;

        let host = self.options.bind_host.as_str();
        let (probed, listener) = bind_first_available(target, PORT_PROBE_ATTEMPTS, |candidate| {
            TcpListener::bind((host, candidate))
        })?;
        if probed != target {
            warn!(
                service = %self.service_name,
                "Port {} not available, using next available port {}", target, probed
            );
        }

        let handle = server::spawn(
            listener,
            ExpositionState {
                service_name: self.service_name.clone(),
                registry: self.registry.clone(),
                health: self.health_status.clone(),
                port: probed,
            },
        )?;
        let bound = handle.port();
        *server = Some(handle);

        info!(service = %self.service_name, port = bound, "Metrics server started");
        info!("Metrics available at: http://localhost:{}/metrics", bound);
        Ok(bound)
    }

    /// Stop the exposition server. Returns false if none was running.
    pub fn stop_server(&self) -> bool {
        match self.server.lock().take() {
            Some(handle) => {
                info!(
                    service = %self.service_name,
                    port = handle.port(),
                    "Shutting down metrics server"
                );
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ServiceMetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetricsRegistry")
            .field("service_name", &self.service_name)
            .field("port", &self.port())
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
