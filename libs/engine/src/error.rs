//! Engine error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("resource {0} not found")]
    ResourceIdNotFound(String),

    #[error("revision {revision_id} of resource {resource_id} not found")]
    RevisionIdNotFound {
        resource_id: String,
        revision_id: String,
    },

    #[error("resource {0} is deleted")]
    ResourceIsDeleted(String),

    #[error("schema conflict for {resource_id}: stored version {stored:?}, expected {expected}")]
    SchemaConflict {
        resource_id: String,
        stored: Option<String>,
        expected: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("permission denied: {actor} may not {action} {object}")]
    PermissionDenied {
        actor: String,
        action: String,
        object: String,
    },

    #[error("blob {0} not found")]
    BlobNotFound(String),

    #[error("JSON patch could not be applied: {0}")]
    PatchFailed(String),

    #[error("remote object changed upstream: expected ETag {expected:?}, found {found:?}")]
    S3Conflict {
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("no migration configured for this resource manager")]
    MigrationNotConfigured,

    #[error("no acting-user context; pass an OpContext or wrap the call in context::scope")]
    ContextMissing,

    #[error(transparent)]
    Format(#[from] tresor_format::FormatError),

    #[error(transparent)]
    QueryParse(#[from] tresor_query::ParseError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the retryable optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::S3Conflict { .. })
    }
}
