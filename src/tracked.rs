use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A subscription event tagged with a resumption cursor.
///
/// Yield these from a subscription to make it resumable: the SSE transport
/// stamps the event's `id:` field with the cursor and a reconnecting client
/// sends the last id it saw back as the `lastEventId` input field, so the
/// producer can pick up after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracked<T> {
    pub id: String,
    pub data: T,
}

pub fn tracked<T>(id: impl Into<String>, data: T) -> Tracked<T> {
    Tracked {
        id: id.into(),
        data,
    }
}

/// Extract the cursor from a serialized subscription event, if it is a
/// [`Tracked`] envelope.
pub fn event_id(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 2 || !obj.contains_key("data") {
        return None;
    }

    obj.get("id")?.as_str()
}
