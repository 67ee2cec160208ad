//! Rust client for [`arpc`].
//!
//! Three links are provided, mirroring the server's transports:
//!  - [`Client`]: plain HTTP, one request per call
//!  - [`BatchLink`]: coalesces calls issued within a scheduling window into
//!    one HTTP request and demultiplexes the streamed responses by index
//!  - [`WsClient`]: multiplexes queries, mutations and subscriptions over a
//!    persistent WebSocket with automatic reconnection
//!  - [`SseClient`]: resumable server-sent-event subscriptions
#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::unwrap_used,
    clippy::panic,
    clippy::todo,
    clippy::panic_in_result_fn
)]
#![allow(clippy::module_inception)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod batch;
mod error;
mod http;
mod sse;
mod ws;

pub use batch::*;
pub use error::*;
pub use http::*;
pub use sse::*;
pub use ws::*;

use arpc::internal::jsonrpc::{Response, ResponseInner, ResultPayload};
use serde_json::Value;

/// Resolve a single response envelope to the call's outcome.
pub(crate) fn response_value(resp: Response) -> Result<Value, ClientError> {
    match resp.inner {
        ResponseInner::Result {
            result: ResultPayload::Data(value),
        } => Ok(value),
        ResponseInner::Error { error } => Err(ClientError::Response(error)),
        ResponseInner::Result { .. } => Err(ClientError::UnexpectedResponse),
    }
}
