use thiserror::Error;

/// Crate-wide error type. The dispatcher folds every variant into a single
/// HTTP response; background drivers record the message and keep ticking.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("no API keys available in the pool")]
    NoKeysAvailable,
    #[error("upstream status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("upstream transport error: {0}")]
    UpstreamTransport(#[source] reqwest::Error),
    #[error("invalid upstream endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid granularity")]
    InvalidGranularity,
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    /// Upstream HTTP status carried by this error, if any.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ProxyError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// How a non-2xx upstream outcome reflects on the key that produced it.
/// The dispatcher and the reconciler apply different policies over the
/// same variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// 401: the upstream rejects the key outright.
    InvalidKey,
    /// 432/433: the key's monthly credits are gone.
    Exhausted,
    /// 429: transient, never punish the key for it.
    RateLimit,
    /// Connection or timeout failure before a status arrived.
    Transport,
    OtherStatus(u16),
}

/// Classify a non-2xx upstream status. Returns `None` for 2xx.
pub fn classify_status(status: u16) -> Option<UpstreamFailure> {
    match status {
        200..=299 => None,
        401 => Some(UpstreamFailure::InvalidKey),
        432 | 433 => Some(UpstreamFailure::Exhausted),
        429 => Some(UpstreamFailure::RateLimit),
        other => Some(UpstreamFailure::OtherStatus(other)),
    }
}
