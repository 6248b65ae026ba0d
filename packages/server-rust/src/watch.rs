//! Stops the service when its own executable is replaced.
//!
//! Development aid: rebuild the binary and the running service shuts down
//! so a supervisor can start the new one.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::network::ShutdownController;
use crate::worker::BackgroundRunnable;

/// Polls the modification time of a file and triggers shutdown once it
/// changes.
#[derive(Debug)]
pub struct BinaryWatch {
    path: PathBuf,
    baseline: Option<SystemTime>,
    shutdown: Arc<ShutdownController>,
}

impl BinaryWatch {
    #[must_use]
    pub fn new(path: PathBuf, shutdown: Arc<ShutdownController>) -> Self {
        let baseline = modified(&path);
        Self {
            path,
            baseline,
            shutdown,
        }
    }

    /// Watches the executable of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable path cannot be determined.
    pub fn current_exe(shutdown: Arc<ShutdownController>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, shutdown))
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[async_trait]
impl BackgroundRunnable for BinaryWatch {
    async fn on_tick(&mut self) {
        if self.shutdown.is_shutting_down() {
            return;
        }
        // A binary being replaced may briefly be missing; check again later.
        let Some(current) = modified(&self.path) else {
            debug!(path = %self.path.display(), "watched binary not readable");
            return;
        };
        if self.baseline != Some(current) {
            info!(path = %self.path.display(), "service binary changed, stopping");
            self.shutdown.trigger_shutdown();
        }
    }
}
