//! Network configuration types for the `pkgsvc` service.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where the service listens, or where a client connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTarget {
    /// TCP host and port. Port 0 means OS-assigned.
    HostPort { host: String, port: u16 },
    /// Filesystem path of a Unix domain socket.
    UnixSocket(PathBuf),
}

impl Default for ServiceTarget {
    fn default() -> Self {
        Self::HostPort {
            host: "127.0.0.1".to_string(),
            port: 7777,
        }
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostPort { host, port } if host.contains(':') => {
                write!(f, "http://[{host}]:{port}")
            }
            Self::HostPort { host, port } => write!(f, "http://{host}:{port}"),
            Self::UnixSocket(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Error returned when a service URL cannot be parsed into a [`ServiceTarget`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetParseError {
    #[error("expected scheme in the service url {0}")]
    MissingScheme(String),
    #[error("unsupported scheme `{scheme}` in the service url {url}")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("expected port and host in the service url {0}")]
    MissingHostOrPort(String),
    #[error("expected a socket path in the service url {0}")]
    MissingPath(String),
}

impl FromStr for ServiceTarget {
    type Err = TargetParseError;

    /// Parses `http://host:port` and `unix:///absolute/path` URLs.
    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| TargetParseError::MissingScheme(url.to_string()))?;

        match scheme {
            "http" => {
                let authority = rest.split('/').next().unwrap_or_default();
                let (host, port) = authority
                    .rsplit_once(':')
                    .ok_or_else(|| TargetParseError::MissingHostOrPort(url.to_string()))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TargetParseError::MissingHostOrPort(url.to_string()))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(TargetParseError::MissingHostOrPort(url.to_string()));
                }
                Ok(Self::HostPort {
                    host: host.to_string(),
                    port,
                })
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(TargetParseError::MissingPath(url.to_string()));
                }
                Ok(Self::UnixSocket(PathBuf::from(rest)))
            }
            other => Err(TargetParseError::UnsupportedScheme {
                scheme: other.to_string(),
                url: url.to_string(),
            }),
        }
    }
}

/// Top-level network configuration for the service.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Per-operation event stream settings.
    pub stream: StreamConfig,
    /// How long `stop` waits for open streams and running workloads before
    /// dropping remaining connections.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-stream configuration controlling backpressure.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bounded mpsc channel capacity for queued events per operation.
    pub event_channel_capacity: usize,
    /// Maximum time a workload blocks on a full event channel before the
    /// stream is treated as broken.
    pub send_timeout: Duration,
    /// Longest progress line sent as a single frame, in bytes. Longer
    /// lines are split across consecutive frames.
    pub max_line_length: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
            send_timeout: Duration::from_secs(30),
            max_line_length: 256 * 1024,
        }
    }
}
