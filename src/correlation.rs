//! Correlation IDs
//!
//! Execution-context-local storage for the identifier that ties log records
//! and metric events to one logical request.
//!
//! Inside a [`scope`] the slot is keyed to the tokio task, so tasks
//! multiplexed on the same worker thread never observe each other's id.
//! Outside any scope the slot falls back to the current OS thread.

use std::cell::RefCell;
use std::future::Future;

use tokio::runtime::Handle;
use tracing::debug;
use uuid::Uuid;

/// Prefix carried by every generated correlation id.
pub const CORRELATION_ID_PREFIX: &str = "req_";

/// Number of hex characters following the prefix.
const CORRELATION_ID_HEX_LEN: usize = 12;

tokio::task_local! {
    static TASK_CORRELATION_ID: RefCell<Option<String>>;
}

thread_local! {
    static THREAD_CORRELATION_ID: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Generate a new correlation id (`req_` followed by 12 hex characters).
///
/// Uniqueness is best-effort; the id is not a security token.
pub fn generate() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}{}", CORRELATION_ID_PREFIX, &hex[..CORRELATION_ID_HEX_LEN])
}

/// Current correlation id of the calling task or thread.
///
/// Async code outside a [`scope`] reads the worker thread's slot, which
/// other tasks on that thread share.
pub fn get() -> Option<String> {
    match TASK_CORRELATION_ID.try_with(|slot| slot.borrow().clone()) {
        Ok(id) => id,
        Err(_) => THREAD_CORRELATION_ID.with(|slot| slot.borrow().clone()),
    }
}

/// Set (or clear, with `None`) the correlation id of the calling task or thread.
///
/// Outside a [`scope`] the id goes to the OS thread slot. From async code
/// that value can be seen by other tasks once the caller yields, so wrap
/// async work in [`scope`] before setting an id.
pub fn set(id: Option<String>) {
    if in_task_scope() {
        TASK_CORRELATION_ID.with(|slot| *slot.borrow_mut() = id);
        return;
    }

    if id.is_some() && Handle::try_current().is_ok() {
        debug!("Correlation id set on a runtime thread outside a task scope");
    }
    THREAD_CORRELATION_ID.with(|slot| *slot.borrow_mut() = id);
}

/// Clear the correlation id of the calling task or thread.
pub fn clear() {
    set(None);
}

/// Whether the caller runs inside a task-keyed [`scope`].
pub fn in_task_scope() -> bool {
    TASK_CORRELATION_ID.try_with(|_| ()).is_ok()
}

/// Run a future with its own task-keyed correlation slot.
///
/// The slot starts out holding `initial` and disappears when the future
/// completes.
pub async fn scope<F>(initial: Option<String>, f: F) -> F::Output
where
    F: Future,
{
    TASK_CORRELATION_ID.scope(RefCell::new(initial), f).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let id = generate();
        assert!(id.starts_with(CORRELATION_ID_PREFIX));
        assert_eq!(id.len(), CORRELATION_ID_PREFIX.len() + CORRELATION_ID_HEX_LEN);
        assert!(id[CORRELATION_ID_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_generate_is_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_thread_round_trip() {
        assert_eq!(get(), None);

        set(Some("req_abc".to_string()));
        assert_eq!(get().as_deref(), Some("req_abc"));

        clear();
        assert_eq!(get(), None);
    }

    #[test]
    fn test_threads_do_not_share() {
        set(Some("req_main".to_string()));

        let seen = std::thread::spawn(get).join().unwrap();
        assert_eq!(seen, None);
        assert_eq!(get().as_deref(), Some("req_main"));

        clear();
    }

    #[tokio::test]
    async fn test_scope_is_isolated_from_thread_slot() {
        set(Some("req_thread".to_string()));

        let inner = scope(None, async {
            assert!(in_task_scope());
            let before = get();
            set(Some("req_task".to_string()));
            (before, get())
        })
        .await;

        assert_eq!(inner, (None, Some("req_task".to_string())));
        assert_eq!(get().as_deref(), Some("req_thread"));
        clear();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_interleaved_tasks_keep_their_own_id() {
        let task = |id: &'static str| {
            scope(Some(id.to_string()), async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    assert_eq!(get().as_deref(), Some(id));
                }
                get()
            })
        };

        let a = tokio::spawn(task("req_a"));
        let b = tokio::spawn(task("req_b"));

        assert_eq!(a.await.unwrap().as_deref(), Some("req_a"));
        assert_eq!(b.await.unwrap().as_deref(), Some("req_b"));
    }

    #[derive(Clone, Default)]
    struct EventCount(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCount {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if event.metadata().target() == module_path!() {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unscoped_set_on_runtime_is_reported() {
        use tracing_subscriber::prelude::*;

        let count = EventCount::default();
        let subscriber = tracing_subscriber::registry().with(count.clone());

        tracing::subscriber::with_default(subscriber, || {
            set(Some("req_loose".to_string()));
            clear();
        });
        assert_eq!(count.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        let subscriber = tracing_subscriber::registry().with(count.clone());
        scope(None, async {
            let _default = tracing::subscriber::set_default(subscriber);
            set(Some("req_scoped".to_string()));
        })
        .await;
        assert_eq!(count.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
