//! Wire messages for the operation RPCs.
//!
//! Requests and events use named `MsgPack` serialization
//! (`rmp_serde::to_vec_named()`) with camelCase field names. Events are
//! internally tagged by a `type` field.

use serde::{Deserialize, Serialize};

use crate::types::OperationOutcome;

/// Request body for `POST /resolve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub package_path: String,
}

/// Request body for `POST /build`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub package_path: String,
}

/// Terminal status codes carried by the final frame of every event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// The operation ran and succeeded.
    Ok,
    /// The resource is busy with another operation; retry later.
    Unavailable,
    /// Engine construction failed, the workload failed, or the operation is
    /// not implemented.
    Unknown,
}

/// Terminal status of an operation stream.
///
/// `message` is always present for non-`Ok` codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcStatus {
    pub code: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl RpcStatus {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Unavailable,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Unknown,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl From<OperationOutcome> for RpcStatus {
    fn from(outcome: OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Success => Self::ok(),
            OperationOutcome::Failure(reason) => Self::unknown(reason),
        }
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self.code {
            StatusCode::Ok => "OK",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Unknown => "UNKNOWN",
        };
        match &self.message {
            Some(message) => write!(f, "{code}: {message}"),
            None => f.write_str(code),
        }
    }
}

/// One frame of an operation's response stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationEvent {
    /// A progress line emitted by the workload, in emission order.
    #[serde(rename = "LOG")]
    Log { log: String },
    /// The terminal status. Always the last frame of a complete stream.
    #[serde(rename = "STATUS")]
    Status { status: RpcStatus },
}

impl OperationEvent {
    #[must_use]
    pub fn log(line: impl Into<String>) -> Self {
        Self::Log { log: line.into() }
    }

    #[must_use]
    pub fn status(status: RpcStatus) -> Self {
        Self::Status { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case_field() {
        let request = ResolveRequest {
            package_path: "/pkg/A".to_string(),
        };
        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        let value: std::collections::BTreeMap<String, String> =
            rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value.get("packagePath").map(String::as_str), Some("/pkg/A"));
    }

    #[test]
    fn tagged_events_decode_by_type() {
        let status = OperationEvent::status(RpcStatus::unavailable("busy"));
        let bytes = rmp_serde::to_vec_named(&status).unwrap();
        let decoded: OperationEvent = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, status);

        let log = OperationEvent::log("Everything up-to-date.");
        let bytes = rmp_serde::to_vec_named(&log).unwrap();
        let decoded: OperationEvent = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, log);
    }

    #[test]
    fn ok_status_omits_message() {
        let bytes = rmp_serde::to_vec_named(&RpcStatus::ok()).unwrap();
        let value: std::collections::BTreeMap<String, String> =
            rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value.len(), 1);
        assert_eq!(value.get("code").map(String::as_str), Some("OK"));
    }

    #[test]
    fn outcome_maps_to_status() {
        assert_eq!(RpcStatus::from(OperationOutcome::Success), RpcStatus::ok());
        let status = RpcStatus::from(OperationOutcome::Failure("bad manifest".to_string()));
        assert_eq!(status.code, StatusCode::Unknown);
        assert_eq!(status.message.as_deref(), Some("bad manifest"));
    }

    #[test]
    fn status_display() {
        assert_eq!(RpcStatus::ok().to_string(), "OK");
        assert_eq!(RpcStatus::unavailable("busy").to_string(), "UNAVAILABLE: busy");
    }
}
