//! Error types for the rastra-core library.
//!
//! This module provides error handling using the `thiserror` crate, with one
//! variant per failure class the container codec can hit. Sniffing never
//! surfaces these: malformed input during detection is reported as a plain
//! `false`.

use thiserror::Error;

/// Result type alias for rastra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all structural container operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The byte stream violates the container's structural rules: a short
    /// read, bad signature, malformed block or packet, or an offset pointing
    /// outside the file bounds.
    #[error("corrupted container structure at offset {offset}: {details}")]
    CorruptedStructure {
        /// Byte offset (relative to the container origin) where the problem
        /// was detected
        offset: u64,
        /// Detailed description of the issue
        details: String,
    },

    /// The container is well-formed but uses a variant this codec does not
    /// handle, such as a plain-text extension block or an unsupported
    /// pixel depth.
    #[error("unsupported container variant: {details}")]
    UnsupportedVariant {
        /// Description of the unsupported construct
        details: String,
    },

    /// The requested access mode is not legal for this container, e.g.
    /// write access to a multi-frame container or random line access over
    /// a run-length stream with spanning runs.
    #[error("illegal access mode: {details}")]
    IllegalAccessMode {
        /// Why the access mode was refused
        details: String,
    },

    /// Underlying read/write/seek failure, passed through unchanged.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a new corrupted-structure error
    pub fn corrupted(offset: u64, details: impl Into<String>) -> Self {
        Self::CorruptedStructure {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new unsupported-variant error
    pub fn unsupported(details: impl Into<String>) -> Self {
        Self::UnsupportedVariant {
            details: details.into(),
        }
    }

    /// Creates a new illegal-access-mode error
    pub fn illegal_access(details: impl Into<String>) -> Self {
        Self::IllegalAccessMode {
            details: details.into(),
        }
    }

    /// Returns true if the container itself is at fault (corruption or an
    /// unsupported variant), as opposed to the caller or the environment.
    pub fn is_container_fault(&self) -> bool {
        matches!(
            self,
            Self::CorruptedStructure { .. } | Self::UnsupportedVariant { .. }
        )
    }
}
