//! Registry Cache
//!
//! Process-scoped map from service name to its metrics registry. Construct
//! one at startup, share it behind an `Arc`, and tear it down with
//! [`RegistryCache::shutdown_all`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::registry::{RegistryOptions, ServiceMetricsRegistry};
use crate::error::Result;
use crate::instrument::Instrumented;

/// At most one registry (and one exposition server) per service name.
#[derive(Default)]
pub struct RegistryCache {
    registries: Mutex<HashMap<String, Arc<ServiceMetricsRegistry>>>,
}

impl RegistryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registry for `service_name`, creating it (and starting its
    /// server when `auto_start` is set) on first use.
    ///
    /// Lookup, construction, insertion and server start all happen under one
    /// lock, so concurrent callers for the same name share one registry.
    /// If the server fails to start the registry stays cached and the error
    /// is returned.
    pub fn setup(
        &self,
        service_name: &str,
        options: RegistryOptions,
        auto_start: bool,
    ) -> Result<Arc<ServiceMetricsRegistry>> {
        let mut registries = self.registries.lock();

        if let Some(existing) = registries.get(service_name) {
            debug!(service = %service_name, "Metrics already setup");
            return Ok(Arc::clone(existing));
        }

        let registry = Arc::new(ServiceMetricsRegistry::new(service_name, options)?);
        registries.insert(service_name.to_string(), Arc::clone(&registry));

        if auto_start {
            registry.start_server(None)?;
        }

        info!(service = %service_name, "Metrics setup completed");
        Ok(registry)
    }

    /// Registry for `service_name`, if set up
    pub fn get(&self, service_name: &str) -> Option<Arc<ServiceMetricsRegistry>> {
        self.registries.lock().get(service_name).cloned()
    }

    /// Number of cached registries
    pub fn len(&self) -> usize {
        self.registries.lock().len()
    }

    /// Whether no registry is cached
    pub fn is_empty(&self) -> bool {
        self.registries.lock().is_empty()
    }

    /// Build an instrumentation wrapper bound to this cache and service.
    pub fn instrument(
        self: &Arc<Self>,
        service_name: &str,
        success_metric: &str,
        failure_metric: &str,
    ) -> Instrumented {
        Instrumented::new(success_metric, failure_metric)
            .cache(Arc::clone(self))
            .service(service_name)
    }

    /// Stop every exposition server and forget all registries.
    ///
    /// Registries still referenced elsewhere stay usable without a server.
    /// Returns the number of servers stopped.
    pub fn shutdown_all(&self) -> usize {
        let mut registries = self.registries.lock();

        let mut stopped = 0;
        for (service_name, registry) in registries.iter() {
            if registry.stop_server() {
                info!(service = %service_name, "Shutdown metrics server");
                stopped += 1;
            }
        }

        registries.clear();
        stopped
    }
}

impl std::fmt::Debug for RegistryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registries = self.registries.lock();
        let mut services: Vec<&String> = registries.keys().collect();
        services.sort();
        f.debug_struct("RegistryCache")
            .field("services", &services)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn local_options() -> RegistryOptions {
        RegistryOptions::default()
            .with_bind_host("127.0.0.1")
            .with_port(0)
    }

    #[test]
    fn test_setup_without_server() {
        let cache = RegistryCache::new();
        assert!(cache.is_empty());

        let registry = cache.setup("reports", local_options(), false).unwrap();
        assert!(!registry.is_server_running());
        assert_eq!(cache.len(), 1);

        let fetched = cache.get("reports").unwrap();
        assert!(Arc::ptr_eq(&registry, &fetched));
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_setup_returns_cached_registry() {
        let cache = RegistryCache::new();

        let first = cache.setup("reports", local_options(), false).unwrap();
        first.record_error("boom", "main");

        // Options of a second setup are ignored
        let second = cache
            .setup("reports", RegistryOptions::default().with_port(1), false)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.error_count("boom", "main"), 1.0);
    }

    #[tokio::test]
    async fn test_setup_starts_server_once() {
        let cache = RegistryCache::new();

        let first = cache.setup("api", local_options(), true).unwrap();
        let port = first.port().unwrap();

        let second = cache.setup("api", local_options(), true).unwrap();
        assert_eq!(second.port(), Some(port));
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let cache = RegistryCache::new();

        let a = cache.setup("a", local_options(), true).unwrap();
        let b = cache.setup("b", local_options(), true).unwrap();
        cache.setup("c", local_options(), false).unwrap();

        assert_eq!(cache.shutdown_all(), 2);
        assert!(cache.is_empty());
        assert!(!a.is_server_running());
        assert!(!b.is_server_running());

        // Registries outlive the cache entries
        a.set_health(false);
        assert!(!a.is_healthy());
        assert_eq!(cache.shutdown_all(), 0);
    }
}
