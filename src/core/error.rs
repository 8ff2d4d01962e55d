use std::path::PathBuf;

use thiserror::Error;

use crate::core::remote::RemoteError;
use crate::instances::common::DocumentError;
use crate::submission::manifest::ManifestError;

/// Error type for experiment phases
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// A control-plane call failed
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A required local file is absent
    #[error("Required file not found: {}", .0.display())]
    MissingLocalFile(PathBuf),
    /// A local configuration document could not be loaded
    #[error(transparent)]
    Document(#[from] DocumentError),
    /// Writing the submission failed
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    /// A phase ran before the state it depends on existed
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ExperimentError {
    /// Process exit status for an aborted run
    pub fn exit_code(&self) -> u8 {
        match self {
            ExperimentError::MissingLocalFile(_) => 2,
            _ => 1,
        }
    }
}
