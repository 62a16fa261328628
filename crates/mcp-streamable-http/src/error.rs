use http::StatusCode;
use thiserror::Error;

use crate::model::RequestId;

/// Errors surfaced by either transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
    #[error("no request id to route the message")]
    NoRequestId,
    #[error("no open connection for request id {0}")]
    NoConnection(RequestId),
    #[error("unauthorized")]
    Unauthorized,
    #[error("request body exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
    #[error("unexpected server response: {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
