//! Error types for the client crate.

use thiserror::Error;

/// Errors surfaced by the client API.
///
/// Transport and timeout failures are deliberately absent: the worker
/// recovers them into a [`crate::Response`] with `status == -1` instead of
/// propagating them to the caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    #[error("unknown encoding label: {0}")]
    UnknownEncoding(String),

    #[error("json decode error: {0}")]
    Json(String),

    #[error("html decode error: {0}")]
    Html(String),

    #[error("xml decode error: {0}")]
    Xml(String),

    #[error("client is closed")]
    Closed,

    #[error("request was cancelled")]
    Cancelled,

    #[error("timed out waiting for a result")]
    ResultTimeout,
}
