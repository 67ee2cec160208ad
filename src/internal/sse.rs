use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ResponseError;

/// The payload of one SSE `data:` line.
///
/// A stream ends with the bare sentinel [`STOPPED`] instead of a JSON
/// payload, so a client can tell natural completion apart from a dropped
/// connection (which it should resume from its last seen event id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum EventPayload {
    Item(Value),
    Error(ResponseError),
}

pub const STOPPED: &str = "stopped";
