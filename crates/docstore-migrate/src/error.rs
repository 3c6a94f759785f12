//! Error types for docstore-migrate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating collections.
///
/// Per-collection failures (`SourceUnavailable`, `DestinationUnavailable` and
/// the transport errors they wrap) are folded into failure counts by the
/// exporter. Startup failures are returned to the caller and end the run.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `--only`/`--skip` filter or registry lookup named no known collection.
    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    /// The source API could not serve a page (transport error or non-2xx).
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source API answered 2xx but reported `success: false` or a malformed body.
    #[error("Source rejected request: {0}")]
    SourceResponse(String),

    /// The source API asked us to slow down (HTTP 429).
    #[error("Rate limited by source, retry after {0}s")]
    RateLimit(u64),

    /// The source API refused our credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A batch write failed.
    #[error("Destination unavailable: {0}")]
    DestinationUnavailable(String),

    /// The destination could not be reached before any collection ran.
    #[error("Destination unreachable: {0}")]
    DestinationUnreachable(String),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Database driver error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Returns true for errors that abort the whole run rather than one collection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::UnknownCollection(_) | Error::DestinationUnreachable(_)
        )
    }

    /// Delay requested by the remote side before the next attempt, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Format the error with its full source chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}
