//! Error types for the change-feed connection.

use thiserror::Error;

/// Connection-level failures of the change feed.
///
/// Any of these ends the current connection; the listener backs off and
/// reconnects from the last persisted cursor.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Connect, read, or TLS failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The feed answered the `_changes` request with a non-2xx status
    #[error("Feed returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Reading the resume cursor failed
    #[error("Cursor error: {0}")]
    Cursor(String),

    /// Anything else that aborts the connection
    #[error("Feed error: {0}")]
    Other(String),
}

impl From<anyhow::Error> for FeedError {
    fn from(err: anyhow::Error) -> Self {
        FeedError::Other(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FeedError::Status {
            status: 401,
            body: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "Feed returned status 401: unauthorized");

        let err = FeedError::Cursor("locked".to_string());
        assert_eq!(err.to_string(), "Cursor error: locked");
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("Failed to read cursor");
        let feed_err: FeedError = err.into();
        assert_eq!(
            feed_err.to_string(),
            "Feed error: Failed to read cursor: disk full"
        );
    }
}
