use thiserror::Error;

/// Failures a request can surface to its caller.
///
/// Cache failures are deliberately absent: the cache layer degrades to a
/// miss on read and drops failed writes, so it never produces one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Rejected before any side effect (bad coordinates, missing field).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The asset store was unreachable, the bucket was missing, or the write failed.
    #[error("asset store error: {0}")]
    AssetStore(String),

    /// Schema creation or upsert against the geo index failed.
    #[error("index error: {0}")]
    Index(String),

    /// The geo index could not answer a search. No stale fallback is served.
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
