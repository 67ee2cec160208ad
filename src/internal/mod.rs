//! Internal types shared between the transports.
//!
//! Nothing in here is subject to semver guarantees; it is public so the
//! transport crates (`arpc-axum`, `arpc-client`) can speak the wire protocol.

pub mod exec;
pub mod jsonrpc;
pub mod sse;
