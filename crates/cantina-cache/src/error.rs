use std::time::Duration;

use thiserror::Error;

/// An error produced while resolving a cache key.
///
/// Only producer failures are ever surfaced through this type; storage-layer
/// problems are contained inside the [`PersistentStore`](crate::PersistentStore)
/// and degrade to a cache miss instead.
///
/// The error is cheap to clone because a single failed producer run is shared
/// by every concurrent waiter for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The producer function failed.
    ///
    /// The attached string carries the producer's own error message.
    #[error("fetch failed: {0}")]
    Producer(String),
    /// The producer gave up after a deadline of its own.
    ///
    /// The coordinator enforces no timeouts itself; this variant exists for
    /// producers that do.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Builds a [`FetchError::Producer`] from any displayable error.
    pub fn producer(err: impl std::fmt::Display) -> Self {
        Self::Producer(err.to_string())
    }
}

/// The outcome of resolving a cache key.
pub type FetchResult<T> = Result<T, FetchError>;
