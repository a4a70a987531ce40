//! Instrumentation Wrapper
//!
//! Higher-order wrappers that run an operation under a correlation id and
//! report its outcome to a service registry:
//!
//! - success: `<success_metric>{component="main"}` += 1, health up, info log
//! - failure: `service_errors_total{error_type=<failure_metric>,component="main"}`
//!   += 1, health down, error log with diagnostic trace, error returned unchanged
//!
//! Instrumentation is best-effort. If no registry can be resolved the
//! operation still runs and only the metric reporting is skipped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::correlation;
use crate::metrics::{RegistryCache, ServiceMetricsRegistry};

/// Default success counter name
pub const DEFAULT_SUCCESS_METRIC: &str = "execution_success";

/// Default failure error type
pub const DEFAULT_FAILURE_METRIC: &str = "execution_failure";

/// Component label used for every wrapped outcome
pub const MAIN_COMPONENT: &str = "main";

/// Hook returning the registry an operation worked against.
pub type RegistryDiscovery = Arc<dyn Fn() -> Option<Arc<ServiceMetricsRegistry>> + Send + Sync>;

/// Instrumentation wrapper configuration.
///
/// Registry resolution order: [`Instrumented::registry`], then
/// [`Instrumented::service`] looked up in [`Instrumented::cache`], then the
/// [`Instrumented::discover`] hook evaluated after the operation ran.
#[derive(Clone)]
pub struct Instrumented {
    success_metric: String,
    failure_metric: String,
    operation: String,
    service_name: Option<String>,
    cache: Option<Arc<RegistryCache>>,
    registry: Option<Arc<ServiceMetricsRegistry>>,
    discovery: Option<RegistryDiscovery>,
}

impl Default for Instrumented {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_METRIC, DEFAULT_FAILURE_METRIC)
    }
}

impl Instrumented {
    /// Create a wrapper reporting under the given metric names.
    pub fn new(success_metric: impl Into<String>, failure_metric: impl Into<String>) -> Self {
        Self {
            success_metric: success_metric.into(),
            failure_metric: failure_metric.into(),
            operation: "operation".to_string(),
            service_name: None,
            cache: None,
            registry: None,
            discovery: None,
        }
    }

    /// Name used in log messages and the success counter description.
    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operation = name.into();
        self
    }

    /// Service whose cached registry receives the metrics.
    pub fn service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Cache used to look up the service registry.
    pub fn cache(mut self, cache: Arc<RegistryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Report straight into this registry.
    pub fn registry(mut self, registry: Arc<ServiceMetricsRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Best-effort fallback consulted after the operation when nothing
    /// else resolved a registry.
    pub fn discover<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Option<Arc<ServiceMetricsRegistry>> + Send + Sync + 'static,
    {
        self.discovery = Some(Arc::new(hook));
        self
    }

    /// Success counter name
    pub fn success_metric(&self) -> &str {
        &self.success_metric
    }

    /// Failure error type
    pub fn failure_metric(&self) -> &str {
        &self.failure_metric
    }

    /// Run a synchronous operation.
    pub fn run<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Debug + fmt::Display,
    {
        let correlation_id = correlation::get().unwrap_or_else(correlation::generate);
        correlation::set(Some(correlation_id.clone()));
        let _reset = CorrelationReset;

        let span = self.span(&correlation_id);
        let _entered = span.enter();

        let registry = self.resolve();
        let result = f();
        let registry = registry.or_else(|| self.discovered());
        self.report(registry.as_deref(), &result, &correlation_id);
        result
    }

    /// Run an asynchronous operation.
    ///
    /// Outside a correlation scope the operation gets its own task-keyed
    /// scope, so the id never leaks onto a worker thread.
    pub async fn run_async<T, E, Fut>(&self, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        if correlation::in_task_scope() {
            self.run_in_scope(fut).await
        } else {
            correlation::scope(correlation::get(), self.run_in_scope(fut)).await
        }
    }

    async fn run_in_scope<T, E, Fut>(&self, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        let correlation_id = correlation::get().unwrap_or_else(correlation::generate);
        correlation::set(Some(correlation_id.clone()));
        let _reset = CorrelationReset;

        let span = self.span(&correlation_id);
        let registry = self.resolve();
        let result = fut.instrument(span.clone()).await;
        let registry = registry.or_else(|| self.discovered());
        span.in_scope(|| self.report(registry.as_deref(), &result, &correlation_id));
        result
    }

    fn span(&self, correlation_id: &str) -> Span {
        info_span!(
            "instrumented",
            operation = %self.operation,
            correlation_id = %correlation_id
        )
    }

    fn resolve(&self) -> Option<Arc<ServiceMetricsRegistry>> {
        if let Some(registry) = &self.registry {
            return Some(Arc::clone(registry));
        }
        let cache = self.cache.as_ref()?;
        cache.get(self.service_name.as_deref()?)
    }

    fn discovered(&self) -> Option<Arc<ServiceMetricsRegistry>> {
        self.discovery.as_ref().and_then(|hook| hook())
    }

    fn report<T, E>(
        &self,
        registry: Option<&ServiceMetricsRegistry>,
        result: &Result<T, E>,
        correlation_id: &str,
    ) where
        E: fmt::Debug + fmt::Display,
    {
        let Some(registry) = registry else {
            debug!(
                operation = %self.operation,
                "No metrics registry resolved, skipping instrumentation"
            );
            return;
        };

        match result {
            Ok(_) => {
                let description = format!("Total number of successful {} executions", self.operation);
                let counter = registry
                    .counter_or_create(&self.success_metric, &description, &["component"])
                    .map_err(|e| e.to_string())
                    .and_then(|vec| {
                        vec.get_metric_with_label_values(&[MAIN_COMPONENT])
                            .map_err(|e| e.to_string())
                    });

                registry.set_health(true);
                match counter {
                    Ok(counter) => {
                        counter.inc();
                        info!(
                            correlation_id,
                            "Successfully recorded {} for {}", self.success_metric, self.operation
                        );
                    }
                    Err(e) => warn!(
                        correlation_id,
                        metric = %self.success_metric,
                        "Skipping success metric: {}", e
                    ),
                }
            }
            Err(e) => {
                registry.record_error(&self.failure_metric, MAIN_COMPONENT);
                registry.set_health(false);
                error!(
                    correlation_id,
                    error = %e,
                    trace = ?e,
                    "Failed to execute {}: {}", self.operation, e
                );
            }
        }
    }
}

impl fmt::Debug for Instrumented {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented")
            .field("success_metric", &self.success_metric)
            .field("failure_metric", &self.failure_metric)
            .field("operation", &self.operation)
            .field("service_name", &self.service_name)
            .finish()
    }
}

/// Clears the caller's correlation id when dropped, including on panic.
struct CorrelationReset;

impl Drop for CorrelationReset {
    fn drop(&mut self) {
        correlation::clear();
    }
}

// =============================================================================
// Error Logging
// =============================================================================

/// Run `f` and log its error, if any, before returning it unchanged.
pub fn log_errors<T, E, F>(operation: &str, f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: fmt::Debug + fmt::Display,
{
    f().inspect_err(|e| log_failure(operation, e))
}

/// Async counterpart of [`log_errors`].
pub async fn log_errors_async<T, E, Fut>(operation: &str, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Debug + fmt::Display,
{
    fut.await.inspect_err(|e| log_failure(operation, e))
}

fn log_failure<E>(operation: &str, e: &E)
where
    E: fmt::Debug + fmt::Display,
{
    error!(
        function = operation,
        error = %e,
        trace = ?e,
        "Error in {}", operation
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RegistryOptions;

    #[derive(Debug, PartialEq)]
    struct JobError(&'static str);

    impl fmt::Display for JobError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "job failed: {}", self.0)
        }
    }

    fn cache_with(service: &str) -> (Arc<RegistryCache>, Arc<ServiceMetricsRegistry>) {
        let cache = Arc::new(RegistryCache::new());
        let registry = cache
            .setup(service, RegistryOptions::default(), false)
            .unwrap();
        (cache, registry)
    }

    fn success_count(registry: &ServiceMetricsRegistry, name: &str) -> f64 {
        registry
            .counter(name)
            .map(|c| c.with_label_values(&[MAIN_COMPONENT]).get())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_success_path() {
        let (cache, registry) = cache_with("ingest");
        registry.set_health(false);

        let wrapper = RegistryCache::instrument(&cache, "ingest", "batch_success", "batch_failure");
        let result: Result<u32, JobError> = wrapper.run(|| Ok(42));

        assert_eq!(result, Ok(42));
        assert_eq!(success_count(&registry, "batch_success"), 1.0);
        assert!(registry.is_healthy());
        assert_eq!(registry.error_count("batch_failure", MAIN_COMPONENT), 0.0);
    }

    #[test]
    fn test_failure_path() {
        let (cache, registry) = cache_with("ingest");

        let wrapper = RegistryCache::instrument(&cache, "ingest", "batch_success", "batch_failure");
        let result: Result<(), JobError> = wrapper.run(|| Err(JobError("disk full")));

        assert_eq!(result, Err(JobError("disk full")));
        assert_eq!(registry.error_count("batch_failure", MAIN_COMPONENT), 1.0);
        assert!(!registry.is_healthy());
        assert_eq!(success_count(&registry, "batch_success"), 0.0);
    }

    #[derive(Clone, Default)]
    struct ErrorFields(Arc<parking_lot::Mutex<Vec<(String, String)>>>);

    impl tracing::field::Visit for ErrorFields {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            self.0
                .lock()
                .push((field.name().to_string(), format!("{:?}", value)));
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorFields {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::ERROR {
                event.record(&mut self.clone());
            }
        }
    }

    #[test]
    fn test_failure_log_carries_error_trace() {
        use tracing_subscriber::prelude::*;

        let (cache, _registry) = cache_with("ingest");
        let wrapper = RegistryCache::instrument(&cache, "ingest", "ok", "ko");
        let fields = ErrorFields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());

        tracing::subscriber::with_default(subscriber, || {
            let _: Result<(), JobError> = wrapper.run(|| Err(JobError("disk full")));
        });

        let recorded = fields.0.lock().clone();
        let value = |name: &str| {
            recorded
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(value("error").as_deref(), Some("job failed: disk full"));
        assert_eq!(value("trace").as_deref(), Some("JobError(\"disk full\")"));
        assert!(value("correlation_id").is_some());
        assert!(value("backtrace").is_none());
    }

    #[test]
    fn test_correlation_cleared_after_run() {
        let (cache, _registry) = cache_with("ingest");
        let wrapper = RegistryCache::instrument(&cache, "ingest", "ok", "ko");

        let seen: Result<Option<String>, JobError> = wrapper.run(|| Ok(correlation::get()));
        let seen = seen.unwrap().unwrap();
        assert!(seen.starts_with(correlation::CORRELATION_ID_PREFIX));
        assert_eq!(correlation::get(), None);

        let _: Result<(), JobError> = wrapper.run(|| Err(JobError("x")));
        assert_eq!(correlation::get(), None);
    }

    #[test]
    fn test_existing_correlation_id_is_reused() {
        let wrapper = Instrumented::default();
        correlation::set(Some("req_preset000000".to_string()));

        let seen: Result<Option<String>, JobError> = wrapper.run(|| Ok(correlation::get()));
        assert_eq!(seen.unwrap().as_deref(), Some("req_preset000000"));
        assert_eq!(correlation::get(), None);
    }

    #[test]
    fn test_missing_registry_still_runs() {
        let cache = Arc::new(RegistryCache::new());
        let wrapper = RegistryCache::instrument(&cache, "unknown", "ok", "ko");

        let mut ran = false;
        let result: Result<(), JobError> = wrapper.run(|| {
            ran = true;
            Ok(())
        });

        assert!(ran);
        assert!(result.is_ok());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_discovery_hook() {
        let registry = Arc::new(
            ServiceMetricsRegistry::new("discovered", RegistryOptions::default()).unwrap(),
        );
        let found = Arc::clone(&registry);

        let wrapper = Instrumented::new("hits", "misses").discover(move || Some(Arc::clone(&found)));
        let _: Result<(), JobError> = wrapper.run(|| Ok(()));

        assert_eq!(success_count(&registry, "hits"), 1.0);
    }

    #[test]
    fn test_explicit_registry_wins() {
        let (cache, cached) = cache_with("cached");
        let direct = Arc::new(
            ServiceMetricsRegistry::new("direct", RegistryOptions::default()).unwrap(),
        );

        let wrapper = RegistryCache::instrument(&cache, "cached", "ok", "ko")
            .registry(Arc::clone(&direct));
        let _: Result<(), JobError> = wrapper.run(|| Ok(()));

        assert_eq!(success_count(&direct, "ok"), 1.0);
        assert_eq!(success_count(&cached, "ok"), 0.0);
    }

    #[test]
    fn test_metric_name_collision_does_not_mask_result() {
        let (cache, registry) = cache_with("clash");
        registry.create_gauge("ok", "not a counter", &[]).unwrap();
        registry.set_health(false);

        let wrapper = RegistryCache::instrument(&cache, "clash", "ok", "ko");
        let result: Result<u8, JobError> = wrapper.run(|| Ok(7));

        assert_eq!(result, Ok(7));
        assert!(registry.counter("ok").is_none());
        assert!(registry.is_healthy());
    }

    #[test]
    fn test_repeated_runs_accumulate() {
        let (cache, registry) = cache_with("loop");
        let wrapper = RegistryCache::instrument(&cache, "loop", "ok", "ko");

        for i in 0..5 {
            let _: Result<(), JobError> = wrapper.run(|| if i % 2 == 0 { Ok(()) } else { Err(JobError("odd")) });
        }

        assert_eq!(success_count(&registry, "ok"), 3.0);
        assert_eq!(registry.error_count("ko", MAIN_COMPONENT), 2.0);
        assert!(registry.is_healthy());
    }

    #[tokio::test]
    async fn test_async_success_and_failure() {
        let (cache, registry) = cache_with("async");
        let wrapper = RegistryCache::instrument(&cache, "async", "ok", "ko");

        let ok: Result<Option<String>, JobError> = wrapper
            .run_async(async {
                tokio::task::yield_now().await;
                Ok(correlation::get())
            })
            .await;
        assert!(ok.unwrap().is_some());
        assert_eq!(correlation::get(), None);

        let err: Result<(), JobError> = wrapper.run_async(async { Err(JobError("late")) }).await;
        assert_eq!(err, Err(JobError("late")));

        assert_eq!(success_count(&registry, "ok"), 1.0);
        assert_eq!(registry.error_count("ko", MAIN_COMPONENT), 1.0);
        assert!(!registry.is_healthy());
    }

    #[tokio::test]
    async fn test_async_inside_scope_clears_scope_slot() {
        let wrapper = Instrumented::default();

        let after = correlation::scope(Some("req_outer0000000".to_string()), async {
            let inner: Result<Option<String>, JobError> =
                wrapper.run_async(async { Ok(correlation::get()) }).await;
            assert_eq!(inner.unwrap().as_deref(), Some("req_outer0000000"));
            correlation::get()
        })
        .await;

        assert_eq!(after, None);
    }

    #[test]
    fn test_log_errors_passthrough() {
        let ok: Result<i32, JobError> = log_errors("compute", || Ok(1));
        assert_eq!(ok, Ok(1));

        let err: Result<i32, JobError> = log_errors("compute", || Err(JobError("nope")));
        assert_eq!(err, Err(JobError("nope")));
    }

    #[tokio::test]
    async fn test_log_errors_async_passthrough() {
        let err: Result<(), JobError> =
            log_errors_async("fetch", async { Err(JobError("timeout")) }).await;
        assert_eq!(err, Err(JobError("timeout")));
    }
}
