//! Workspace progress events and their text rendering.
//!
//! Each event becomes exactly one line on the caller's stream.

use std::fmt;

/// Why a resolution pass is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveReason {
    /// No pins have been recorded for the package yet.
    MissingPins,
    /// The listed dependencies differ from their recorded pins.
    RequirementsChanged(Vec<String>),
    /// Pins exist and are being checked against the manifest.
    Verification,
}

impl fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPins => f.write_str("(no pins recorded)"),
            Self::RequirementsChanged(names) => {
                write!(f, "(requirements changed: {})", names.join(", "))
            }
            Self::Verification => f.write_str("(verifying pins)"),
        }
    }
}

/// A progress event reported by a workspace operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    WillResolveDependencies { reason: ResolveReason },
    Fetching { repository: String },
    Updating { repository: String },
    Cloning { repository: String },
    CheckingOut { repository: String, reference: String },
    Removing { repository: String },
    UpToDate,
}

impl fmt::Display for WorkspaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WillResolveDependencies { reason } => {
                write!(f, "Will resolve dependencies {reason}")
            }
            Self::Fetching { repository } => write!(f, "Fetching {repository}"),
            Self::Updating { repository } => write!(f, "Updating {repository}"),
            Self::Cloning { repository } => write!(f, "Cloning {repository}"),
            Self::CheckingOut {
                repository,
                reference,
            } => write!(f, "Checking out {repository} at {reference}"),
            Self::Removing { repository } => write!(f, "Removing {repository}"),
            Self::UpToDate => f.write_str("Everything up-to-date."),
        }
    }
}
