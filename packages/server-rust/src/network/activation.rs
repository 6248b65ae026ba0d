//! Listeners handed over by the OS service manager.
//!
//! The service can start on a socket that is already bound and listening,
//! either passed in by the embedding program or inherited through systemd
//! socket activation (`LISTEN_PID`, `LISTEN_FDS`, `LISTEN_FDNAMES`).

use std::collections::HashSet;
use std::io;
use std::net::TcpListener;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;

use parking_lot::Mutex;
use tracing::debug;

/// First descriptor passed by systemd.
const SD_LISTEN_FDS_START: RawFd = 3;

/// An already-bound, listening socket.
#[derive(Debug)]
pub enum BoundSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BoundSocket {
    /// Classifies an inherited listening descriptor by its address family.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is neither a Unix nor a TCP socket.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let unix = UnixListener::from(fd);
        if unix.local_addr().is_ok() {
            return Ok(Self::Unix(unix));
        }
        let tcp = TcpListener::from(OwnedFd::from(unix));
        tcp.local_addr()?;
        Ok(Self::Tcp(tcp))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("process was not socket activated")]
    NotActivated,
    #[error("invalid {var}: {value}")]
    InvalidEnvironment { var: &'static str, value: String },
    #[error("no activated socket named `{name}` (available: {available:?})")]
    UnknownName { name: String, available: Vec<String> },
    #[error("activated socket `{0}` was already claimed")]
    AlreadyClaimed(String),
    #[error("activated socket `{name}` is not a supported listener: {source}")]
    UnsupportedSocket { name: String, source: io::Error },
}

/// Source of pre-bound listeners, looked up by name.
pub trait SocketActivation: Send + Sync {
    /// Takes ownership of the listener registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ActivationError`] if no such listener was handed over.
    fn acquire(&self, name: &str) -> Result<BoundSocket, ActivationError>;
}

/// systemd socket activation.
#[derive(Debug)]
pub struct SystemdActivation {
    first_fd: RawFd,
    names: Vec<String>,
    claimed: Mutex<HashSet<RawFd>>,
}

impl SystemdActivation {
    /// Reads the activation environment of the current process.
    ///
    /// # Errors
    ///
    /// Returns [`ActivationError::NotActivated`] if `LISTEN_PID` is missing
    /// or names another process.
    pub fn from_env() -> Result<Self, ActivationError> {
        let pid = std::env::var("LISTEN_PID").map_err(|_| ActivationError::NotActivated)?;
        let pid: u32 = pid
            .parse()
            .map_err(|_| ActivationError::InvalidEnvironment {
                var: "LISTEN_PID",
                value: pid.clone(),
            })?;
        if pid != std::process::id() {
            return Err(ActivationError::NotActivated);
        }

        let fds = std::env::var("LISTEN_FDS").map_err(|_| ActivationError::NotActivated)?;
        let count: usize = fds.parse().map_err(|_| ActivationError::InvalidEnvironment {
            var: "LISTEN_FDS",
            value: fds.clone(),
        })?;
        let names = std::env::var("LISTEN_FDNAMES").ok();

        Ok(Self::new(SD_LISTEN_FDS_START, count, names.as_deref()))
    }

    /// Activation state for `count` descriptors starting at `first_fd`.
    /// Unnamed descriptors get systemd's default name `unknown`.
    #[must_use]
    pub fn new(first_fd: RawFd, count: usize, names: Option<&str>) -> Self {
        let mut names: Vec<String> = names
            .map(|n| n.split(':').map(ToString::to_string).collect())
            .unwrap_or_default();
        names.resize(count, "unknown".to_string());
        Self {
            first_fd,
            names,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    fn fd_for(&self, name: &str) -> Result<RawFd, ActivationError> {
        let index = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| ActivationError::UnknownName {
                name: name.to_string(),
                available: self.names.clone(),
            })?;
        let offset = RawFd::try_from(index).map_err(|_| ActivationError::InvalidEnvironment {
            var: "LISTEN_FDS",
            value: self.names.len().to_string(),
        })?;
        Ok(self.first_fd + offset)
    }
}

impl SocketActivation for SystemdActivation {
    fn acquire(&self, name: &str) -> Result<BoundSocket, ActivationError> {
        let fd = self.fd_for(name)?;
        if !self.claimed.lock().insert(fd) {
            return Err(ActivationError::AlreadyClaimed(name.to_string()));
        }

        #[allow(unsafe_code)]
        // SAFETY: systemd passes `LISTEN_FDS` open descriptors starting at
        // `first_fd` to this process, and `claimed` ensures each one is
        // adopted at most once.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };

        debug!(name, fd, "adopted activated socket");
        BoundSocket::from_owned_fd(owned).map_err(|source| ActivationError::UnsupportedSocket {
            name: name.to_string(),
            source,
        })
    }
}
