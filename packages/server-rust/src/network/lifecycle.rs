//! Service lifecycle: start on a target or an adopted socket, stop, and wait
//! for close.
//!
//! `PackageService` owns the listener task. Every method takes `&self`, so
//! the service can be shared behind an `Arc` between the task that started
//! it and whatever decides to stop it (a signal handler, the binary watch).

use std::fmt;
use std::future::{Future, IntoFuture};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::activation::BoundSocket;
use super::config::{NetworkConfig, ServiceTarget};
use super::handlers::{
    build_handler, health_handler, liveness_handler, readiness_handler, resolve_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::{LifecycleState, ShutdownController};
use crate::engine::EngineFactory;
use crate::operation::OperationRegistry;
use crate::watch::BinaryWatch;
use crate::worker::BackgroundWorker;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub network: NetworkConfig,
    /// Stop the service when its executable is modified.
    pub stop_on_binary_change: bool,
    /// Poll interval of the binary watch.
    pub watch_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            stop_on_binary_change: false,
            watch_interval: Duration::from_secs(2),
        }
    }
}

/// The address the service actually listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "http://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("service was already started")]
    AlreadyStarted,
    #[error("service was never started")]
    NotStarted,
    #[error("failed to listen on {target}: {source}")]
    Bind { target: String, source: io::Error },
    #[error("{} is in use by a live listener or a non-socket file", .0.display())]
    SocketPathInUse(PathBuf),
    #[error("failed to adopt bound socket: {0}")]
    Adopt(#[source] io::Error),
}

enum Listener {
    Tcp(TcpListener),
    /// The path is set when the service created the socket file and must
    /// remove it on close.
    Unix(UnixListener, Option<PathBuf>),
}

/// Exposes the resolve and build RPCs on one listener.
pub struct PackageService {
    config: ServiceConfig,
    state: AppState,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl PackageService {
    /// Creates the service in the `Created` state. Nothing is bound yet.
    #[must_use]
    pub fn new(config: ServiceConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let shutdown = Arc::new(ShutdownController::new());
        let state = AppState::new(
            OperationRegistry::new(factory),
            shutdown,
            config.network.clone(),
        );
        Self {
            config,
            state,
            server: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.state.registry
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state.shutdown.state()
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness check
    /// - `GET /health/ready` -- readiness check
    /// - `POST /resolve` -- resolve operation (`MsgPack` in, event stream out)
    /// - `POST /build` -- build operation (`MsgPack` in, event stream out)
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/resolve", post(resolve_handler))
            .route("/build", post(build_handler))
            .layer(build_http_layers())
            .with_state(self.state.clone())
    }

    /// Binds `target` and starts serving.
    ///
    /// Returns the endpoint actually bound; for port 0 it carries the
    /// OS-assigned port.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyStarted`] on a second start, or a
    /// bind error. A failed bind leaves the service startable again.
    pub async fn start(&self, target: &ServiceTarget) -> Result<LocalEndpoint, LifecycleError> {
        if !self.state.shutdown.begin_start() {
            return Err(LifecycleError::AlreadyStarted);
        }
        let listener = match bind(target).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.shutdown.abort_start();
                return Err(e);
            }
        };
        let endpoint = local_endpoint(&listener).map_err(|source| LifecycleError::Bind {
            target: target.to_string(),
            source,
        });
        match endpoint {
            Ok(endpoint) => {
                self.launch(listener, &endpoint);
                Ok(endpoint)
            }
            Err(e) => {
                self.state.shutdown.abort_start();
                Err(e)
            }
        }
    }

    /// Starts serving on a socket that is already bound and listening.
    ///
    /// Returns whether the service is active afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyStarted`] on a second start, or
    /// [`LifecycleError::Adopt`] if the socket cannot be used.
    pub async fn start_with_bound_socket(&self, socket: BoundSocket) -> Result<bool, LifecycleError> {
        if !self.state.shutdown.begin_start() {
            return Err(LifecycleError::AlreadyStarted);
        }
        let adopted = adopt(socket).and_then(|listener| {
            let endpoint = local_endpoint(&listener)?;
            Ok((listener, endpoint))
        });
        match adopted {
            Ok((listener, endpoint)) => {
                self.launch(listener, &endpoint);
                Ok(self.state() == LifecycleState::Running)
            }
            Err(e) => {
                self.state.shutdown.abort_start();
                Err(LifecycleError::Adopt(e))
            }
        }
    }

    fn launch(&self, listener: Listener, endpoint: &LocalEndpoint) {
        let router = self.build_router();
        let shutdown = Arc::clone(&self.state.shutdown);
        let tracker = Arc::clone(&self.state.tracker);
        let drain_timeout = self.config.network.drain_timeout;

        let mut binary_watch = None;
        if self.config.stop_on_binary_change {
            match BinaryWatch::current_exe(Arc::clone(&shutdown)) {
                Ok(runnable) => {
                    binary_watch = Some(BackgroundWorker::start(runnable, self.config.watch_interval));
                }
                Err(e) => warn!(error = %e, "cannot locate service binary, not watching it"),
            }
        }

        let (server, socket_path): (ServeFuture, Option<PathBuf>) = match listener {
            Listener::Tcp(listener) => {
                let server: ServeFuture = Box::pin(
                    axum::serve(listener, router)
                        .with_graceful_shutdown(shutdown_requested(shutdown.shutdown_receiver()))
                        .into_future(),
                );
                (server, None)
            }
            Listener::Unix(listener, path) => {
                let server: ServeFuture = Box::pin(
                    axum::serve(listener, router)
                        .with_graceful_shutdown(shutdown_requested(shutdown.shutdown_receiver()))
                        .into_future(),
                );
                (server, path)
            }
        };

        let signal = shutdown.shutdown_receiver();

        let handle = tokio::spawn(async move {
            let mut server = server;
            let finished = tokio::select! {
                result = &mut server => Some(result),
                () = shutdown_requested(signal) => None,
            };

            // Closing the listener and draining operations share one budget.
            let deadline = tokio::time::Instant::now() + drain_timeout;
            let result = match finished {
                Some(result) => Some(result),
                None => tokio::time::timeout_at(deadline, server).await.ok(),
            };
            match result {
                Some(Ok(())) => {}
                Some(Err(e)) => error!(error = %e, "server terminated with an error"),
                None => warn!(
                    active = tracker.count(),
                    "drain timeout expired, listener closed with connections still open"
                ),
            }

            // Request shutdown in case the server ended on its own.
            shutdown.trigger_shutdown();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if !shutdown.wait_for_drain(remaining).await {
                for op in tracker.snapshot() {
                    warn!(
                        id = %op.id,
                        package = %op.key,
                        kind = %op.kind,
                        running_secs = op.started_at.elapsed().as_secs(),
                        "operation still running at shutdown"
                    );
                }
            }
            if let Some(worker) = binary_watch.as_mut() {
                worker.stop().await;
            }
            if let Some(path) = socket_path {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
            shutdown.mark_closed();
            info!("service stopped");
        });

        *self.server.lock() = Some(handle);
        if self.state.shutdown.set_running() {
            info!(%endpoint, "service listening");
        }
    }

    /// Stops accepting requests, signals running engines to terminate and
    /// waits until the listener is closed.
    ///
    /// Returns at most `drain_timeout` after shutdown was requested. Streams
    /// still open at that point keep running on their connection tasks but
    /// are no longer awaited. Calling `stop` on a stopped service does
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotStarted`] if the service was never
    /// started.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        match self.state() {
            LifecycleState::Created => return Err(LifecycleError::NotStarted),
            LifecycleState::Stopped => return Ok(()),
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping => {}
        }
        info!("stopping service");
        self.state.shutdown.trigger_shutdown();
        self.wait_for_close().await
    }

    /// Waits until the listener is closed and in-flight work has drained,
    /// or `drain_timeout` has passed since shutdown was requested.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotStarted`] if the service was never
    /// started.
    pub async fn wait_for_close(&self) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::Created {
            return Err(LifecycleError::NotStarted);
        }
        let server = self.server.lock().take();
        if let Some(server) = server {
            if let Err(e) = server.await {
                error!(error = %e, "server task failed");
                self.state.shutdown.mark_closed();
            }
        }
        self.state.shutdown.wait_closed().await;
        Ok(())
    }
}

impl fmt::Debug for PackageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageService")
            .field("state", &self.state())
            .field("registry", &self.state.registry)
            .finish_non_exhaustive()
    }
}

type ServeFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

async fn shutdown_requested(mut signal: watch::Receiver<bool>) {
    // The controller owns the sender, so the channel cannot close first.
    let _ = signal.wait_for(|stopping| *stopping).await;
}

async fn bind(target: &ServiceTarget) -> Result<Listener, LifecycleError> {
    let bind_error = |source| LifecycleError::Bind {
        target: target.to_string(),
        source,
    };
    match target {
        ServiceTarget::HostPort { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(bind_error)?;
            Ok(Listener::Tcp(listener))
        }
        ServiceTarget::UnixSocket(path) => {
            remove_stale_socket(path)?;
            let listener = UnixListener::bind(path).map_err(bind_error)?;
            Ok(Listener::Unix(listener, Some(path.clone())))
        }
    }
}

/// Removes a leftover socket file. A socket that still accepts connections
/// and any other kind of file are left alone.
fn remove_stale_socket(path: &Path) -> Result<(), LifecycleError> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixStream;

    let bind_error = |source| LifecycleError::Bind {
        target: format!("unix://{}", path.display()),
        source,
    };
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                return Err(LifecycleError::SocketPathInUse(path.to_path_buf()));
            }
            std::fs::remove_file(path).map_err(bind_error)?;
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        }
        Ok(_) => Err(LifecycleError::SocketPathInUse(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(bind_error(e)),
    }
}

fn adopt(socket: BoundSocket) -> io::Result<Listener> {
    match socket {
        BoundSocket::Tcp(listener) => {
            listener.set_nonblocking(true)?;
            Ok(Listener::Tcp(TcpListener::from_std(listener)?))
        }
        BoundSocket::Unix(listener) => {
            listener.set_nonblocking(true)?;
            Ok(Listener::Unix(UnixListener::from_std(listener)?, None))
        }
    }
}

fn local_endpoint(listener: &Listener) -> io::Result<LocalEndpoint> {
    match listener {
        Listener::Tcp(listener) => Ok(LocalEndpoint::Tcp(listener.local_addr()?)),
        Listener::Unix(listener, _) => {
            let addr = listener.local_addr()?;
            let path = addr.as_pathname().map(Path::to_path_buf).unwrap_or_default();
            Ok(LocalEndpoint::Unix(path))
        }
    }
}
