// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {crate::publisher::PublishStage, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path {0}: {1:?}")]
    IoPath(String, std::io::Error),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[cfg(feature = "swift")]
    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("{backend} error on {path}: {message}")]
    Backend {
        backend: String,
        path: String,
        message: String,
    },

    #[error("{path} already exists with different content (existing {existing}, wanted {wanted})")]
    Conflict {
        path: String,
        existing: String,
        wanted: String,
    },

    #[error("pool already holds {checksum} as {existing}; refusing to import it as {wanted}")]
    PoolFilename {
        checksum: String,
        existing: String,
        wanted: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{} of {attempted} operations failed; first error: {first}", failed.len())]
    PartialFailure {
        attempted: usize,
        failed: Vec<String>,
        first: Box<PublishError>,
    },

    #[error("invalid published path {0:?}: {1}")]
    InvalidPath(String, &'static str),

    #[error("invalid content digest {0}: {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("rename of {from} to {to} interrupted after state {state}")]
    RenameInterrupted {
        from: String,
        to: String,
        state: &'static str,
    },

    #[error("{1} not supported by {0}")]
    Unsupported(String, &'static str),

    #[error("invalid storage location {0}: {1}")]
    StorageLocation(String, String),

    #[error("{0}")]
    Publish(Box<PublishFailure>),
}

impl PublishError {
    /// Construct a [PublishError::Backend] from anything printable.
    pub fn backend(
        backend: impl ToString,
        path: impl ToString,
        message: impl std::fmt::Debug,
    ) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            path: path.to_string(),
            message: format!("{:?}", message),
        }
    }

    /// Whether this error represents a content hash mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Describes a failed publish operation.
///
/// The previously published tree is left untouched whenever one of these is
/// returned. The one exception is a failed restore of a replaced index file
/// after a failed promotion: such paths appear in `failures` alongside the
/// original error.
#[derive(Debug)]
pub struct PublishFailure {
    /// Human readable destination (storage description plus distribution path).
    pub destination: String,
    /// The stage whose work failed.
    pub stage: PublishStage,
    /// Paths that failed and why.
    pub failures: Vec<(String, PublishError)>,
}

impl std::fmt::Display for PublishFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "publish to {} failed during {} ({} failed paths)",
            self.destination,
            self.stage,
            self.failures.len()
        )?;

        for (path, err) in &self.failures {
            write!(f, "\n  {}: {}", path, err)?;
        }

        Ok(())
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, PublishError>;
