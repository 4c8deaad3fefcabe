//! Error types for hybrid-cache-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The request's cancellation token fired.
    #[error("Cache operation cancelled")]
    Cancelled,

    /// The caller-supplied producer failed. The cache performs no mutation.
    #[error("Producer failed: {0}")]
    Producer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Collaborator-reported failure (metadata layer, injected hooks).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Wrap an arbitrary producer error.
    pub fn producer<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Producer(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
