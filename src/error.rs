//! Error taxonomy for the hoarder core.
//!
//! Call sites attach context with `anyhow::Context` the way the rest of
//! this codebase does; this enum only distinguishes the *kinds* that the
//! workers and the fetch layer need to branch on (retriable vs not,
//! blacklist-worthy vs not).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HoarderError {
    /// Failed to reach the server at all. Retriable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Upstream asked for a cooldown (429/420/500/503/504). Retriable
    /// after the rate gate has been advanced.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A non-200 response that isn't one of the retriable codes.
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// All retries were consumed without success.
    #[error("out of retries")]
    OutOfRetries,

    /// Malformed JSON, headers, or CSV.
    #[error("parse error: {0}")]
    Parse(String),

    /// Dump file I/O failure.
    #[error("dump io error: {0}")]
    Io(#[from] std::io::Error),

    /// OAuth token refresh failure.
    #[error("auth error: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, HoarderError>;
