//! Error types for identifier sources and batch allocation.
//!
//! Every fallible operation in this crate returns [`Result`], whose error is
//! the single [`Error`] enum below. Failures are never partial: when an
//! operation returns an error, no identifier from it has been handed out.
//!
//! ## Error Cases
//! - `InvalidSource`: the source is retired or otherwise unusable.
//! - `SourceNotFound`: no source exists with the given id.
//! - `InsufficientCapacity`: a pool or generator cannot satisfy the request.
//! - `UpstreamUnavailable`: a remote source kept failing after all retries.
//! - `DuplicateIdentifier`: identifiers added to a pool collide with existing
//!   ones.
//! - `Validation`: a request or source definition is malformed.
//! - `Storage`: the persistence collaborator failed.

use crate::source::SourceId;
use core::fmt;
use serde::Serialize;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for identifier sources.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The source cannot be used to generate identifiers.
    #[error("Invalid source {source_id}: {reason}")]
    InvalidSource { source_id: SourceId, reason: String },

    /// No source is stored under this id.
    #[error("Identifier source {0} not found")]
    SourceNotFound(SourceId),

    /// The source cannot produce the requested number of identifiers, even
    /// after attempting replenishment.
    #[error("Source {source_id} cannot supply {requested} identifiers ({available} available)")]
    InsufficientCapacity {
        source_id: SourceId,
        requested: usize,
        available: usize,
    },

    /// A remote source failed on every attempt or returned malformed data.
    #[error("Upstream for source {source_id} unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable {
        source_id: SourceId,
        attempts: u32,
        reason: String,
    },

    /// Identifiers offered to a pool that are already buffered, already
    /// issued, or repeated within the offer itself.
    #[error("{} duplicate identifier(s): {}", identifiers.len(), identifiers.join(", "))]
    DuplicateIdentifier { identifiers: Vec<String> },

    /// The request or the source definition is invalid.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// The persistence collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Shorthand for a single-field [`Error::Validation`].
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::default();
        errors.reject(field, message);
        Self::Validation(errors)
    }
}

/// A rejected field of a source definition or request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Field errors collected while validating a source definition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn reject(&mut self, field: &'static str, message: impl Into<String>) {
        self.0.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    /// Converts the collected errors into a result, failing if any field was
    /// rejected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}
