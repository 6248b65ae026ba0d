//! Lifecycle state and graceful shutdown control with in-flight tracking.
//!
//! Uses `ArcSwap` for lock-free lifecycle transitions and an atomic counter
//! with RAII guards for in-flight operation tracking. Engines observe the
//! shutdown signal through a `watch` receiver so long-running workloads can
//! stop early when the service is going down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Service lifecycle state.
///
/// State machine: Created -> Starting -> Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, no listener yet.
    Created,
    /// A listener is being bound or adopted.
    Starting,
    /// The listener is active and requests are accepted.
    Running,
    /// Shutdown was requested; no new operations are admitted.
    Stopping,
    /// The listener is closed and in-flight work has drained.
    Stopped,
}

impl LifecycleState {
    /// Lowercase name used in health responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// Controls graceful shutdown with lifecycle state and in-flight tracking.
///
/// The controller coordinates shutdown across the service:
/// 1. Health checks read `state()` to report readiness
/// 2. Operation handlers check state before admitting new work
/// 3. `trigger_shutdown()` moves to Stopping and signals all receivers
/// 4. `wait_for_drain()` waits until in-flight operations complete
/// 5. `mark_closed()` moves to Stopped and wakes `wait_closed()` callers
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    closed_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Created` state.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        let (closed_tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: shutdown_tx,
            closed_signal: closed_tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Created)),
        }
    }

    /// Atomically moves `Created` to `Starting`.
    ///
    /// Returns `false` (and changes nothing) if the service already left
    /// the `Created` state.
    pub fn begin_start(&self) -> bool {
        let previous = self.state.rcu(|current| {
            if **current == LifecycleState::Created {
                Arc::new(LifecycleState::Starting)
            } else {
                Arc::clone(current)
            }
        });
        *previous == LifecycleState::Created
    }

    /// Returns a failed start attempt to `Created` so `start` may be retried.
    ///
    /// If shutdown was requested while starting, the service is marked
    /// closed instead so that `wait_closed()` callers are released.
    pub fn abort_start(&self) {
        let previous = self.state.rcu(|current| {
            if **current == LifecycleState::Starting {
                Arc::new(LifecycleState::Created)
            } else {
                Arc::clone(current)
            }
        });
        if *previous == LifecycleState::Stopping {
            self.mark_closed();
        }
    }

    /// Transitions to `Running`, indicating the listener accepts requests.
    ///
    /// Returns `false` if shutdown was requested in the meantime, in which
    /// case the state is left alone.
    pub fn set_running(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            LifecycleState::Created | LifecycleState::Starting => {
                Arc::new(LifecycleState::Running)
            }
            _ => Arc::clone(current),
        });
        matches!(
            *previous,
            LifecycleState::Created | LifecycleState::Starting | LifecycleState::Running
        )
    }

    /// Returns a receiver that will be notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Initiates graceful shutdown.
    ///
    /// Transitions to `Stopping` and signals all shutdown receivers. Has no
    /// effect once the service is already stopping or stopped.
    pub fn trigger_shutdown(&self) {
        let previous = self.state.rcu(|current| match **current {
            LifecycleState::Stopping | LifecycleState::Stopped => Arc::clone(current),
            _ => Arc::new(LifecycleState::Stopping),
        });
        if matches!(
            *previous,
            LifecycleState::Stopping | LifecycleState::Stopped
        ) {
            return;
        }
        // `send_replace` stores the value even when no receiver is subscribed yet
        self.shutdown_signal.send_replace(true);
    }

    /// Returns `true` once shutdown has been triggered.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    /// Marks the listener closed: transitions to `Stopped` and wakes waiters.
    pub fn mark_closed(&self) {
        self.state.store(Arc::new(LifecycleState::Stopped));
        self.closed_signal.send_replace(true);
    }

    /// Waits until `mark_closed()` has been called.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_signal.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Creates an RAII guard that tracks an in-flight operation.
    ///
    /// The in-flight counter is incremented on creation and decremented
    /// when the guard is dropped, even if the workload panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Returns the current number of in-flight operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for all in-flight operations to complete, up to the given timeout.
    ///
    /// Returns `true` if everything drained, `false` if the timeout expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
