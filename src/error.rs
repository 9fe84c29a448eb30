//! Error taxonomy shared across the manager.
//!
//! Transient variants mean "skip this tick, retry on the next one"; the
//! reconciler only treats a failed heartbeat as fatal. [`Error::NotReady`]
//! marks unmet preconditions (no credentials yet, server not answering) that
//! are logged at info level rather than warn.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store i/o: {0}")]
    Store(#[from] sqlx::Error),

    #[error("daemon i/o: {0}")]
    Daemon(#[from] bollard::errors::Error),

    #[error("api i/o: {0}")]
    Api(#[from] reqwest::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("image not present: {0}")]
    ImageMissing(String),

    #[error("{0}")]
    NotReady(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Error::NotReady(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Unmet precondition rather than a failure; logged at info level.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
