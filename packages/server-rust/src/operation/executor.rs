//! Runs admitted operations on the blocking pool.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use pkgsvc_core::{EventSink, OperationKind, OperationOutcome};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use super::registry::Lease;
use crate::engine::EngineContext;

/// Drives engines off the request-handling tasks.
///
/// Each call to [`perform`](Self::perform) runs on its own blocking worker,
/// so a slow workload never stalls the accept loop or operations on other
/// keys.
#[derive(Debug, Clone)]
pub struct OperationExecutor {
    terminate: watch::Receiver<bool>,
}

impl OperationExecutor {
    /// `terminate` flips to `true` when the service shuts down; engines
    /// observe it through their [`EngineContext`].
    #[must_use]
    pub fn new(terminate: watch::Receiver<bool>) -> Self {
        Self { terminate }
    }

    /// Runs `kind` against the leased engine, forwarding every progress
    /// line to `sink` as it is produced.
    ///
    /// The lease is released exactly once after the workload returns,
    /// fails or panics.
    pub async fn perform(
        &self,
        lease: Lease,
        kind: OperationKind,
        sink: Arc<dyn EventSink>,
    ) -> OperationOutcome {
        let key = lease.key().clone();
        let terminate = self.terminate.clone();
        let started = Instant::now();

        gauge!("pkgsvc_active_operations").increment(1.0);
        debug!(package = %key, %kind, "operation started");

        let joined = tokio::task::spawn_blocking(move || {
            let ctx = EngineContext::new(sink.as_ref(), terminate);
            let result = {
                let mut engine = lease.engine();
                match kind {
                    OperationKind::Resolve => engine.resolve(&ctx),
                    OperationKind::Build => engine.build(&ctx),
                }
            };
            lease.release();
            result
        })
        .await;

        gauge!("pkgsvc_active_operations").decrement(1.0);

        let outcome = match joined {
            Ok(Ok(())) => OperationOutcome::Success,
            Ok(Err(e)) => {
                warn!(package = %key, %kind, error = %e, "operation failed");
                OperationOutcome::Failure(e.to_string())
            }
            Err(e) => {
                let reason = join_failure(e);
                error!(package = %key, %kind, %reason, "operation worker aborted");
                OperationOutcome::Failure(reason)
            }
        };

        let elapsed = started.elapsed();
        counter!(
            "pkgsvc_operations_total",
            "kind" => kind.as_str(),
            "outcome" => outcome.label()
        )
        .increment(1);
        histogram!("pkgsvc_operation_duration_seconds", "kind" => kind.as_str())
            .record(elapsed.as_secs_f64());
        debug!(
            package = %key,
            %kind,
            outcome = outcome.label(),
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "operation finished"
        );

        outcome
    }
}

fn join_failure(err: JoinError) -> String {
    if err.is_panic() {
        format!("workload panicked: {}", panic_message(&*err.into_panic()))
    } else {
        "workload cancelled".to_string()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
