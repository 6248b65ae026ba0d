//! Bookkeeping of running operations for health reporting and shutdown logs.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use pkgsvc_core::{OperationKind, OperationRequest, ResourceKey};
use uuid::Uuid;

/// Identifier assigned to each admitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub Uuid);

impl OperationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A running operation as seen by the tracker.
#[derive(Debug, Clone)]
pub struct ActiveOperation {
    pub id: OperationId,
    pub key: ResourceKey,
    pub kind: OperationKind,
    pub started_at: Instant,
}

/// Concurrent set of running operations.
#[derive(Debug, Default)]
pub struct OperationTracker {
    operations: DashMap<OperationId, ActiveOperation>,
}

impl OperationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `request` as running until the returned guard is dropped.
    #[must_use]
    pub fn track(self: &Arc<Self>, request: &OperationRequest) -> TrackedOperation {
        let id = OperationId::new();
        self.operations.insert(
            id,
            ActiveOperation {
                id,
                key: request.key.clone(),
                kind: request.kind,
                started_at: Instant::now(),
            },
        );
        TrackedOperation {
            id,
            tracker: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.operations.len()
    }

    /// Snapshot of running operations, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActiveOperation> {
        let mut active: Vec<_> = self.operations.iter().map(|e| e.value().clone()).collect();
        active.sort_by_key(|op| op.started_at);
        active
    }
}

/// RAII registration of one running operation.
#[derive(Debug)]
pub struct TrackedOperation {
    id: OperationId,
    tracker: Arc<OperationTracker>,
}

impl TrackedOperation {
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }
}

impl Drop for TrackedOperation {
    fn drop(&mut self) {
        self.tracker.operations.remove(&self.id);
    }
}
