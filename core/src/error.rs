//! Error taxonomy.
//!
//! Storage backends report [`StorageError`]; the command pipeline, reservation
//! engine and read repository translate everything into [`CatalogError`], the
//! only error type callers see.

use crate::event_bus::EventBusError;
use thiserror::Error;

/// Errors raised by the ledger, replica, cache and event log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A conditional update touched fewer rows than expected: a concurrent
    /// writer already advanced the version.
    #[error("Version conflict on {entity} {id}")]
    VersionConflict {
        /// Entity kind ("product" or "store")
        entity: &'static str,
        /// Identifier of the first row that failed its version check
        id: String,
    },

    /// A unique constraint rejected the write.
    #[error("Duplicate key: {0}")]
    Duplicate(String),

    /// Backend unavailable or query failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Row or document could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Sub-classification of [`CatalogError::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Name or slug already taken by another product
    Uniqueness,
    /// Optimistic version mismatch
    Version,
    /// Fewer available slots than requested
    InsufficientStock,
}

/// Caller-facing error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Command fields failed their declared constraints. No mutation happened.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The command collides with current state.
    #[error("{message}")]
    Conflict {
        /// What kind of collision
        kind: ConflictKind,
        /// Human-readable description
        message: String,
    },

    /// The referenced product or slot does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A store or the bus is unavailable.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),
}

impl CatalogError {
    /// Build a conflict error.
    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    /// Build a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Whether retrying the same command may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                kind: ConflictKind::Version,
                ..
            }
        )
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict { .. } => Self::conflict(ConflictKind::Version, err.to_string()),
            StorageError::Duplicate(_) => Self::conflict(ConflictKind::Uniqueness, err.to_string()),
            StorageError::Backend(_) | StorageError::Serialization(_) => {
                Self::Infrastructure(err.to_string())
            }
        }
    }
}

impl From<EventBusError> for CatalogError {
    fn from(err: EventBusError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}
