//! Operation admission, execution and progress streaming.
//!
//! A request flows through [`OperationRegistry::acquire`] (single-flight per
//! key), [`OperationExecutor::perform`] (blocking worker) and a
//! [`StreamSink`] feeding the response body.

pub mod executor;
pub mod registry;
pub mod sink;
pub mod tracker;

pub use executor::OperationExecutor;
pub use registry::{AcquireError, Lease, OperationRegistry};
pub use sink::{event_channel, event_stream, status_stream, StreamSink};
pub use tracker::{ActiveOperation, OperationId, OperationTracker, TrackedOperation};
