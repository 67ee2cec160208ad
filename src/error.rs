use std::{error, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An error that can be returned from a procedure or middleware.
///
/// The `cause` is kept for local debugging (it ends up in logs) but is never
/// serialized onto the wire.
#[derive(Clone, Debug, Serialize)]
pub struct Error {
    pub(crate) code: ErrorCode,
    pub(crate) message: String,
    #[serde(skip)]
    pub(crate) cause: Option<Arc<dyn error::Error + Send + Sync>>, // We are using `Arc` instead of `Box` so we can clone the error cause `Clone` isn't dyn safe.
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arpc::Error {{ code: {:?}, message: {} }}",
            self.code, self.message
        )
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

impl Error {
    pub const fn new(code: ErrorCode, message: String) -> Self {
        Error {
            code,
            message,
            cause: None,
        }
    }

    pub fn with_cause<TErr>(code: ErrorCode, message: String, cause: TErr) -> Self
    where
        TErr: error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            message,
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The underlying error this one was raised from, if any. Available for
    /// local inspection (e.g. inside an error formatter); never serialized.
    pub fn cause(&self) -> Option<&(dyn error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

/// The category of an [`Error`], mapped onto an HTTP status code when it
/// crosses the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    Conflict,
    PreconditionFailed,
    PayloadTooLarge,
    MethodNotSupported,
    ClientClosedRequest,
    InternalServerError,
}

impl ErrorCode {
    pub fn to_status_code(&self) -> u16 {
        match self {
            ErrorCode::ParseError => 400,
            ErrorCode::BadRequest => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Timeout => 408,
            ErrorCode::Conflict => 409,
            ErrorCode::PreconditionFailed => 412,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::MethodNotSupported => 405,
            ErrorCode::ClientClosedRequest => 499,
            ErrorCode::InternalServerError => 500,
        }
    }

    pub const fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            400 => Some(ErrorCode::BadRequest),
            401 => Some(ErrorCode::Unauthorized),
            403 => Some(ErrorCode::Forbidden),
            404 => Some(ErrorCode::NotFound),
            408 => Some(ErrorCode::Timeout),
            409 => Some(ErrorCode::Conflict),
            412 => Some(ErrorCode::PreconditionFailed),
            413 => Some(ErrorCode::PayloadTooLarge),
            405 => Some(ErrorCode::MethodNotSupported),
            499 => Some(ErrorCode::ClientClosedRequest),
            500 => Some(ErrorCode::InternalServerError),
            _ => None,
        }
    }
}

/// The serialized form of an [`Error`].
///
/// Built exactly once per failed call and then passed through the router's
/// error formatter (if any) before hitting the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<Error> for ResponseError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code,
            status: err.code.to_status_code(),
            message: err.message,
            data: None,
        }
    }
}

/// Internal errors raised while executing a request.
///
/// These never escape the dispatch boundary: every variant is converted once
/// into an [`Error`] (and from there into a [`ResponseError`]).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ExecError {
    #[error("the request could not be parsed: {0}")]
    ParseError(serde_json::Error),
    #[error("the requested operation is not supported by this server")]
    OperationNotFound,
    #[error("invalid JSON-RPC version")]
    InvalidJsonRpcVersion,
    #[error("error creating subscription with null request id")]
    ErrSubscriptionWithNullId,
    #[error("error creating subscription with duplicate id")]
    ErrSubscriptionDuplicateId,
    #[error("error the current transport does not support subscriptions")]
    ErrSubscriptionsNotSupported,
    #[error("error running request extractors")]
    ExtractorError,
    #[error("a procedure or middleware panicked during execution")]
    ResolverPanic,
    #[error("error `arpc` got into an unreachable state. Please report this issue to developers!")]
    UnreachableInternalState,
    #[error("resolver: {0}")]
    Resolver(#[from] Error),
}

impl From<ExecError> for Error {
    fn from(v: ExecError) -> Self {
        match v {
            ExecError::ParseError(err) => Error::with_cause(
                ErrorCode::ParseError,
                "the request could not be parsed".into(),
                err,
            ),
            ExecError::OperationNotFound => Error::new(
                ErrorCode::NotFound,
                "the requested operation is not supported by this server".into(),
            ),
            ExecError::InvalidJsonRpcVersion => {
                Error::new(ErrorCode::BadRequest, "invalid JSON-RPC version".into())
            }
            ExecError::ErrSubscriptionWithNullId => Error::new(
                ErrorCode::BadRequest,
                "error creating subscription with null request id".into(),
            ),
            ExecError::ErrSubscriptionDuplicateId => Error::new(
                ErrorCode::BadRequest,
                "error creating subscription with duplicate id".into(),
            ),
            ExecError::ErrSubscriptionsNotSupported => Error::new(
                ErrorCode::BadRequest,
                "error the current transport does not support subscriptions".into(),
            ),
            ExecError::ExtractorError => Error::new(
                ErrorCode::BadRequest,
                "error running request extractors".into(),
            ),
            ExecError::ResolverPanic => Error::new(
                ErrorCode::InternalServerError,
                "a procedure or middleware panicked during execution".into(),
            ),
            ExecError::UnreachableInternalState => Error::new(
                ErrorCode::InternalServerError,
                "the server got into an unreachable state".into(),
            ),
            ExecError::Resolver(err) => err,
        }
    }
}
