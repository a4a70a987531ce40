//! Termination Coordinator
//!
//! A process-wide termination flag set by SIGINT/SIGTERM and polled by
//! long-running loops between units of work. Shutdown is advisory: nothing
//! is cancelled, callers stop picking up new work once the flag is set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

use crate::error::{Error, Result};

/// Pause after a signal so in-flight work can observe the flag.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Poll interval for [`TerminationCoordinator::wait_for_termination`] callers
/// without a specific need.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lower bound on a wait slice; a zero interval would never yield a sleep.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle of the termination flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    /// No termination requested yet
    Running,
    /// Terminal: a signal (or explicit request) arrived
    TerminationRequested,
}

impl std::fmt::Display for TerminationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationState::Running => write!(f, "Running"),
            TerminationState::TerminationRequested => write!(f, "TerminationRequested"),
        }
    }
}

/// Shared termination flag plus the signal-handling policy.
#[derive(Debug)]
pub struct TerminationCoordinator {
    requested: AtomicBool,
    grace_period: Duration,
}

impl Default for TerminationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminationCoordinator {
    /// Create a coordinator with [`DEFAULT_GRACE_PERIOD`]
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    /// Create a coordinator with a custom grace period
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            requested: AtomicBool::new(false),
            grace_period,
        }
    }

    /// Configured grace period
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Whether termination was requested
    pub fn is_termination_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Current state
    pub fn state(&self) -> TerminationState {
        if self.is_termination_requested() {
            TerminationState::TerminationRequested
        } else {
            TerminationState::Running
        }
    }

    /// Move to `TerminationRequested`. Returns true only for the call that
    /// performed the transition.
    pub fn request_termination(&self) -> bool {
        !self.requested.swap(true, Ordering::AcqRel)
    }

    /// Record a received signal, then hold for the grace period.
    pub async fn handle_signal(&self, signal: &str) {
        info!(
            signal,
            "Shutdown signal received. Waiting for current processing to complete..."
        );
        self.request_termination();
        tokio::time::sleep(self.grace_period).await;
    }

    /// Spawn a task that feeds SIGINT and SIGTERM into this coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let handle = Handle::try_current().map_err(|e| {
            Error::Internal(format!("signal handlers require a tokio runtime: {}", e))
        })?;
        let _guard = handle.enter();
        spawn_signal_listener(&handle, Arc::clone(self))
    }

    /// Wait up to `timeout` for termination, rechecking every `poll_interval`.
    ///
    /// Each slice sleeps on the tokio timer, so the calling task yields and a
    /// single-threaded runtime keeps running other tasks. Returns true as
    /// soon as the flag is observed, false once `timeout` elapsed without it.
    pub async fn wait_for_termination(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        // None when the timeout is too large to represent: wait for the flag only
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if self.is_termination_requested() {
                return true;
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(slice).await;
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listener(
    handle: &Handle,
    coordinator: Arc<TerminationCoordinator>,
) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(handle.spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = term.recv() => "SIGTERM",
                Some(()) = interrupt.recv() => "SIGINT",
                else => break,
            };
            coordinator.handle_signal(name).await;
        }
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(
    handle: &Handle,
    coordinator: Arc<TerminationCoordinator>,
) -> Result<JoinHandle<()>> {
    Ok(handle.spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            coordinator.handle_signal("CTRL_C").await;
        }
    }))
}

// =============================================================================
// Tests
// =============================================================================
