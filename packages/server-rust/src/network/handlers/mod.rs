//! HTTP handler definitions for the `pkgsvc` service.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for building the router.

pub mod health;
pub mod operations;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use operations::{build_handler, resolve_handler, EVENTS_CONTENT_TYPE};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::operation::{OperationExecutor, OperationRegistry, OperationTracker};

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Single-flight admission for package operations.
    pub registry: OperationRegistry,
    /// Runs admitted operations on the blocking pool.
    pub executor: OperationExecutor,
    /// Operations currently running, for health reporting.
    pub tracker: Arc<OperationTracker>,
    /// Lifecycle state, shutdown signal and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (stream backpressure, drain timeout).
    pub config: Arc<NetworkConfig>,
    /// Service start time, used for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        registry: OperationRegistry,
        shutdown: Arc<ShutdownController>,
        config: NetworkConfig,
    ) -> Self {
        Self {
            registry,
            executor: OperationExecutor::new(shutdown.shutdown_receiver()),
            tracker: Arc::new(OperationTracker::new()),
            shutdown,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }
}
