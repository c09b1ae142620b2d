//! Error taxonomy for the request path.
//!
//! Orchestration code (dispatcher, supervisor) uses [`anyhow`] with context,
//! but the per-request hot path needs to distinguish error kinds: transport
//! failures and bad responses are recovered locally by the virtual user,
//! while dataset and payload problems have different blast radii.

use thiserror::Error;

/// An error which occurred while issuing a request or consuming its response.
///
/// All of these are recovered locally: the virtual user records a failure
/// event and continues its loop.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Connection refused, DNS failure, TCP reset, or any other error
    /// surfaced by the HTTP client before a status line was read.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// A connect or read deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a non-200 status.
    #[error("HTTP {status}: {body_snippet}")]
    HttpStatus { status: u16, body_snippet: String },

    /// The stream carried something unparseable where JSON was required.
    #[error("malformed stream record: {0}")]
    StreamFormat(String),

    /// The response parsed, but carries an application-level error marker.
    #[error("response contains error: {0}")]
    ResponseError(String),
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RequestError::Timeout
        } else {
            RequestError::Transport(err)
        }
    }
}

/// The request template could not be turned into a payload. The virtual
/// user skips the iteration.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("request payload is not valid JSON: {0}")]
    InvalidTemplate(#[source] serde_json::Error),
}

/// The dataset was unreadable or yielded zero valid records. Fatal to the
/// virtual-user runtime; surfaced as a task failure.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset yielded no valid records")]
    Empty,
}

/// Truncate a user-visible error message to what the store can hold.
///
/// MySQL-style TEXT columns cap at 65,535 bytes; we stay under that and
/// append a tail marker recording the original length.
pub fn truncate_error_message(message: &str) -> String {
    const MAX_LEN: usize = 65_000;
    if message.chars().count() <= MAX_LEN {
        return message.to_owned();
    }
    let truncated: String = message.chars().take(MAX_LEN - 100).collect();
    format!(
        "{truncated}\n... (truncated, original length: {})",
        message.chars().count()
    )
}
