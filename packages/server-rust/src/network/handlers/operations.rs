//! `POST /resolve` and `POST /build`: streaming operation endpoints.
//!
//! Both take a MsgPack request body and always answer 200 with a stream of
//! length-delimited `OperationEvent` frames. Admission and workload errors
//! are reported in the terminal `STATUS` frame, never as HTTP errors.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use http::header;
use metrics::counter;
use pkgsvc_core::{
    BuildRequest, CodecError, EventSink, OperationKind, OperationRequest, ResolveRequest,
    ResourceKey, RpcStatus,
};
use serde::de::DeserializeOwned;
use tracing::{error, info, info_span, warn, Instrument};

use super::AppState;
use crate::operation::{event_channel, event_stream, status_stream, AcquireError};

/// Content type of operation event streams.
pub const EVENTS_CONTENT_TYPE: &str = "application/vnd.pkgsvc.events+msgpack";

/// Resolves the dependencies of the package at `packagePath`.
pub async fn resolve_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ResolveRequest = match decode_request(&body, OperationKind::Resolve) {
        Ok(request) => request,
        Err(status) => return status_response(status),
    };
    let key = match ResourceKey::parse(&request.package_path) {
        Ok(key) => key,
        Err(e) => return status_response(RpcStatus::unknown(e.to_string())),
    };
    run_operation(state, OperationRequest::new(key, OperationKind::Resolve)).await
}

/// Builds are not supported: every request ends with `UNKNOWN` without
/// touching the registry.
pub async fn build_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request: BuildRequest = match decode_request(&body, OperationKind::Build) {
        Ok(request) => request,
        Err(status) => return status_response(status),
    };
    if state.shutdown.is_shutting_down() {
        return reject_shutting_down();
    }
    info!(package = %request.package_path, "build requested");
    status_response(RpcStatus::unknown(format!(
        "unimplemented build request for {}",
        request.package_path
    )))
}

async fn run_operation(state: AppState, request: OperationRequest) -> Response {
    let in_flight = state.shutdown.in_flight_guard();
    if state.shutdown.is_shutting_down() {
        return reject_shutting_down();
    }

    // Opening an engine may hit the filesystem.
    let registry = state.registry.clone();
    let key = request.key.clone();
    let lease = match tokio::task::spawn_blocking(move || registry.acquire(&key)).await {
        Ok(Ok(lease)) => lease,
        Ok(Err(AcquireError::Busy)) => {
            info!(package = %request.key, kind = %request.kind, "rejected: resource busy");
            counter!("pkgsvc_operations_rejected_total", "reason" => "busy").increment(1);
            return status_response(RpcStatus::unavailable(AcquireError::Busy.to_string()));
        }
        Ok(Err(AcquireError::Engine(e))) => {
            warn!(package = %request.key, error = %e, "cannot open package engine");
            counter!("pkgsvc_operations_rejected_total", "reason" => "engine").increment(1);
            return status_response(RpcStatus::unknown(e.to_string()));
        }
        Err(e) => {
            error!(package = %request.key, error = %e, "admission task failed");
            return status_response(RpcStatus::unknown(format!("admission failed: {e}")));
        }
    };

    let tracked = state.tracker.track(&request);
    let span = info_span!(
        "operation",
        id = %tracked.id(),
        package = %request.key,
        kind = %request.kind,
    );
    let (sink, rx) = event_channel(&state.config.stream);
    let executor = state.executor.clone();

    // Detached so the workload finishes and releases even if the client
    // goes away.
    tokio::spawn(
        async move {
            let _in_flight = in_flight;
            let _tracked = tracked;
            let worker_sink: Arc<dyn EventSink> = sink.clone();
            let outcome = executor.perform(lease, request.kind, worker_sink).await;
            let status = RpcStatus::from(outcome);
            info!(%status, "operation complete");
            sink.finish(status).await;
        }
        .instrument(span),
    );

    events_response(event_stream(rx))
}

fn decode_request<T: DeserializeOwned>(body: &[u8], kind: OperationKind) -> Result<T, RpcStatus> {
    rmp_serde::from_slice(body).map_err(|e| {
        warn!(%kind, error = %e, "malformed request body");
        RpcStatus::unknown(format!("malformed {kind} request: {e}"))
    })
}

fn reject_shutting_down() -> Response {
    counter!("pkgsvc_operations_rejected_total", "reason" => "shutting_down").increment(1);
    status_response(RpcStatus::unavailable("service is shutting down"))
}

fn status_response(status: RpcStatus) -> Response {
    events_response(status_stream(status))
}

fn events_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, CodecError>> + Send + 'static,
{
    (
        [(header::CONTENT_TYPE, EVENTS_CONTENT_TYPE)],
        Body::from_stream(stream),
    )
        .into_response()
}
