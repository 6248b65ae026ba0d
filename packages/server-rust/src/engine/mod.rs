//! Workload engines: the long-running, per-package work behind each operation.
//!
//! The service treats an engine as opaque. It is constructed once per
//! [`ResourceKey`] by an [`EngineFactory`], kept for the lifetime of the
//! service, and driven on a blocking worker with an [`EngineContext`] that
//! relays progress lines to the caller.

pub mod events;
pub mod pinning;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

use pkgsvc_core::{EventSink, ResourceKey};
use tokio::sync::watch;

pub use events::{ResolveReason, WorkspaceEvent};
pub use pinning::{Dependency, EngineConfig, PinningEngine, PinningEngineFactory};

/// Errors surfaced by engines and engine factories.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine for a package could not be created (bad path, missing
    /// manifest, toolchain discovery failure).
    #[error("cannot open package at {path}: {reason}")]
    Construction { path: PathBuf, reason: String },
    #[error("unimplemented {operation} operation")]
    Unimplemented { operation: &'static str },
    #[error("operation terminated: service is shutting down")]
    Terminated,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl EngineError {
    pub(crate) fn construction(key: &ResourceKey, reason: impl Into<String>) -> Self {
        Self::Construction {
            path: key.as_path().to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Per-package workload. Accessed by at most one thread at a time.
pub trait PackageEngine: Send {
    /// Resolves the package's dependencies, reporting progress through `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if resolution fails or is terminated.
    fn resolve(&mut self, ctx: &EngineContext<'_>) -> Result<(), EngineError>;

    /// Builds the package. Engines without build support keep the default.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unimplemented`] unless overridden.
    fn build(&mut self, _ctx: &EngineContext<'_>) -> Result<(), EngineError> {
        Err(EngineError::Unimplemented { operation: "build" })
    }
}

/// Creates engines on first reference to a package.
pub trait EngineFactory: Send + Sync + 'static {
    /// Opens the engine for `key`. May touch the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Construction`] if the package cannot be opened.
    fn open(&self, key: &ResourceKey) -> Result<Box<dyn PackageEngine>, EngineError>;
}

/// What a running engine may see of the service: a progress sink and the
/// shutdown signal.
pub struct EngineContext<'a> {
    sink: &'a dyn EventSink,
    terminate: watch::Receiver<bool>,
}

impl<'a> EngineContext<'a> {
    #[must_use]
    pub fn new(sink: &'a dyn EventSink, terminate: watch::Receiver<bool>) -> Self {
        Self { sink, terminate }
    }

    /// Context that never observes a shutdown. Useful when driving an
    /// engine outside the service.
    #[must_use]
    pub fn detached(sink: &'a dyn EventSink) -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(sink, rx)
    }

    /// Reports a workspace event as exactly one progress line.
    pub fn emit(&self, event: &WorkspaceEvent) {
        self.sink.send(event.to_string());
    }

    /// Reports a free-form progress line.
    pub fn message(&self, line: impl Into<String>) {
        self.sink.send(line.into());
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        *self.terminate.borrow()
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Terminated`] once the service is shutting down.
    pub fn check_terminated(&self) -> Result<(), EngineError> {
        if self.is_terminating() {
            Err(EngineError::Terminated)
        } else {
            Ok(())
        }
    }
}
