//! `pkgsvc` core: resource keys, operation types, and the event stream protocol.

pub mod codec;
pub mod messages;
pub mod sink;
pub mod types;

pub use codec::{CodecError, EventCodec};
pub use messages::{BuildRequest, OperationEvent, ResolveRequest, RpcStatus, StatusCode};
pub use sink::EventSink;
pub use types::{KeyError, OperationKind, OperationOutcome, OperationRequest, ResourceKey};
