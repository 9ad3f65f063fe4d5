use std::time::Duration;

/// Failure of a single unit fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Timeouts, connection resets, 408/429 and 5xx responses. Retry-eligible.
    #[error("transient network error for {url}: {reason}")]
    Transient {
        url: String,
        reason: String,
        retry_after: Option<Duration>,
    },

    /// The page was reachable but unusable. Never retried. When the page still
    /// exposed a forward link it is kept so the chain can continue past it.
    #[error("permanent content error for {url}: {reason}")]
    Permanent {
        url: String,
        reason: String,
        next_url: Option<String>,
    },

    /// The run was cancelled while waiting to (re)try. Nothing was recorded.
    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("download status for series '{slug}' is corrupt: {reason}")]
    Corruption { slug: String, reason: String },

    #[error("series '{slug}' is locked by another run")]
    Locked { slug: String },
}

#[derive(Debug, thiserror::Error)]
#[error("packaging volume {index} ({path}) failed")]
pub struct PackagingError {
    pub index: usize,
    pub path: String,
    #[source]
    pub source: anyhow::Error,
}
