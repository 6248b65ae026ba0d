//! `pkgsvc` server: single-flight package operations streamed over HTTP.
//!
//! At most one resolve or build runs per package at a time. Workloads run
//! on the blocking pool and their progress is streamed back to the caller
//! as length-delimited `MsgPack` frames.

pub mod client;
pub mod engine;
pub mod network;
pub mod operation;
pub mod watch;
pub mod worker;

pub use client::{ClientError, ServiceClient};
pub use engine::{EngineContext, EngineError, EngineFactory, PackageEngine, PinningEngineFactory};
pub use network::{LifecycleError, LocalEndpoint, PackageService, ServiceConfig, ServiceTarget};
pub use operation::{AcquireError, OperationExecutor, OperationRegistry};
