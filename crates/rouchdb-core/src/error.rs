use thiserror::Error;

/// All errors that RouchDB can produce.
#[derive(Debug, Error)]
pub enum RouchError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: document update conflict")]
    Conflict,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid revision format: {0}")]
    InvalidRev(String),

    #[error("missing document id")]
    MissingId,

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Multipart parse failure, digest mismatch, or malformed wire payload.
    #[error("codec error: {0}")]
    Codec(String),

    /// A remote peer returned an error the replicator cannot recover from
    /// (any 4xx other than 401).
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// An operation was stopped before completion (replicator/tracker `stop()`).
    #[error("cancelled")]
    Cancelled,
}

impl RouchError {
    /// True for errors a caller may reasonably retry (network/IO hiccups).
    ///
    /// `Unauthorized` is deliberately excluded: a 401 isn't retried by the
    /// ordinary backoff loop at all, since retrying the same request with
    /// the same credentials can't succeed. The change tracker instead
    /// handles it separately — one retry after consulting its configured
    /// authorizer, fatal on a second consecutive 401.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RouchError::Io(_) | RouchError::DatabaseError(_))
    }
}

pub type Result<T> = std::result::Result<T, RouchError>;
