use std::sync::Arc;

use arpc::ResponseError;

/// Errors surfaced to a caller.
///
/// Transport-level failures hit every call that was in flight on the failed
/// connection or batch, so the type is `Clone` (sources are `Arc`-wrapped).
/// A [`ClientError::Response`] only ever concerns a single call.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(Arc<reqwest::Error>),
    #[error("error decoding response: {0}")]
    Decode(Arc<serde_json::Error>),
    #[error("the server replied with an error: {0:?}")]
    Response(ResponseError),
    #[error("the connection closed before the call completed")]
    ConnectionClosed,
    #[error("the client was closed")]
    Closed,
    #[error("the server response ended before answering this call")]
    MissingResponse,
    #[error("the server sent an unexpected frame for this call")]
    UnexpectedResponse,
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(Arc::new(err))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(Arc::new(err))
    }
}
