//! Networking: configuration, listeners, handlers and the service lifecycle.

pub mod activation;
pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod shutdown;

pub use activation::{ActivationError, BoundSocket, SocketActivation, SystemdActivation};
pub use config::*;
pub use handlers::AppState;
pub use lifecycle::{LifecycleError, LocalEndpoint, PackageService, ServiceConfig};
pub use shutdown::*;
