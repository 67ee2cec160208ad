//! arpc: A fast and easy to use typesafe RPC framework for Rust.
//!
//! Procedures (queries, mutations and subscriptions) are registered on a
//! [`Router`] and executed over one of the transports in `arpc-axum`
//! (batched HTTP, WebSocket, Server-Sent Events) or called from Rust via
//! `arpc-client`.
#![warn(
    clippy::all,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::panic,
    clippy::todo,
    clippy::panic_in_result_fn,
    // missing_docs
)]
#![forbid(unsafe_code)]
#![allow(clippy::module_inception)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
mod middleware;
mod procedure;
mod router;
mod router_builder;
mod tracked;

pub mod internal;

pub use error::*;
pub use middleware::*;
pub use procedure::*;
pub use router::*;
pub use router_builder::*;
pub use tracked::*;
