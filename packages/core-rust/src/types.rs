//! Resource keys, operation kinds, and operation outcomes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical absolute path identifying a package resource.
///
/// Equality is exact path equality. Callers are responsible for any
/// normalization; the key is taken as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(PathBuf);

/// Error returned when a string cannot be used as a [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("package path is empty")]
    Empty,
    #[error("package path must be absolute: {0}")]
    NotAbsolute(String),
}

impl ResourceKey {
    /// Builds a key from a client-supplied path string.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the path is empty or relative.
    pub fn parse(path: &str) -> Result<Self, KeyError> {
        if path.is_empty() {
            return Err(KeyError::Empty);
        }
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(KeyError::NotAbsolute(path.display().to_string()));
        }
        Ok(Self(path))
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for ResourceKey {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// The exclusive operations a client can request against a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Resolve,
    Build,
}

impl OperationKind {
    /// Stable lowercase name, used for routes, log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Build => "build",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub key: ResourceKey,
    pub kind: OperationKind,
}

impl OperationRequest {
    #[must_use]
    pub fn new(key: ResourceKey, kind: OperationKind) -> Self {
        Self { key, kind }
    }
}

/// Result of running an admitted operation. Exactly one per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Failure(String),
}

impl OperationOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Label used for the `outcome` metric dimension.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
        }
    }
}
