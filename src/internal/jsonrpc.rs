use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ResponseError;

/// The correlation id of a request.
///
/// `Null` is reserved for messages not tied to a request: parse-error
/// responses and server-initiated notifications.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Null,
    Number(u32),
    String(String),
}

impl RequestId {
    fn null() -> Self {
        Self::Null
    }
}

/// An incoming request frame, modeled on JSON-RPC 2.0.
///
/// The `jsonrpc` tag is optional; when a request carries it, every response
/// to that id echoes it back.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default = "RequestId::null")]
    pub id: RequestId,
    #[serde(flatten)]
    pub inner: RequestInner,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum RequestInner {
    Query {
        path: Cow<'static, str>,
        input: Option<Value>,
    },
    Mutation {
        path: Cow<'static, str>,
        input: Option<Value>,
    },
    Subscription {
        path: Cow<'static, str>,
        input: Option<Value>,
    },
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

/// An outgoing response frame: `{ id, result }` or `{ id, error }`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<Cow<'static, str>>,
    pub id: RequestId,
    #[serde(flatten)]
    pub inner: ResponseInner,
}

impl Response {
    pub fn data(id: RequestId, value: Value) -> Self {
        Self::result(id, ResultPayload::Data(value))
    }

    pub fn started(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Started)
    }

    pub fn stopped(id: RequestId) -> Self {
        Self::result(id, ResultPayload::Stopped)
    }

    pub fn error(id: RequestId, error: ResponseError) -> Self {
        Self {
            jsonrpc: None,
            id,
            inner: ResponseInner::Error { error },
        }
    }

    fn result(id: RequestId, result: ResultPayload) -> Self {
        Self {
            jsonrpc: None,
            id,
            inner: ResponseInner::Result { result },
        }
    }

    /// Echo the `jsonrpc: "2.0"` tag iff the request carried one.
    pub fn with_jsonrpc(mut self, requested: bool) -> Self {
        self.jsonrpc = requested.then_some(Cow::Borrowed("2.0"));
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ResponseInner {
    Result { result: ResultPayload },
    Error { error: ResponseError },
}

/// The lifecycle of a call on the wire. Queries and mutations produce exactly
/// one `data` payload; a subscription is acknowledged with `started`, emits
/// zero or more `data` payloads and terminates with `stopped` (or an error
/// response).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ResultPayload {
    Started,
    Data(Value),
    Stopped,
}

/// One element of a streamed batch response: the envelope tagged with the
/// index of the call it answers. Batched calls are correlated by position,
/// not id, so out-of-order completion is fine.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BatchItem {
    pub index: usize,
    #[serde(flatten)]
    pub response: Response,
}

/// A server-initiated request, sent with `id: null`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationMessage {
    pub id: RequestId,
    pub method: NotificationMethod,
}

impl NotificationMessage {
    /// Ask every client to drop its socket and reconnect. Useful when
    /// restarting or redeploying the service.
    pub fn reconnect() -> Self {
        Self {
            id: RequestId::Null,
            method: NotificationMethod::Reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationMethod {
    Reconnect,
}

/// Everything a client can receive over a persistent connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    Response(Response),
    Notification(NotificationMessage),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_query_request() {
        let req: Request = serde_json::from_value(json!({
            "id": 1,
            "method": "query",
            "params": { "path": "greeting", "input": null },
        }))
        .expect("deserialize");

        assert_eq!(req.id, RequestId::Number(1));
        assert!(matches!(
            req.inner,
            RequestInner::Query { ref path, ref input } if path == "greeting" && input.is_none()
        ));
    }

    #[test]
    fn deserialize_request_without_id() {
        let req: Request = serde_json::from_value(json!({
            "method": "subscription.stop",
        }))
        .expect("deserialize");

        assert_eq!(req.id, RequestId::Null);
        assert!(matches!(req.inner, RequestInner::SubscriptionStop));
    }

    #[test]
    fn serialize_data_response() {
        let resp = Response::data(RequestId::Number(1), json!("hello world"));
        assert_eq!(
            serde_json::to_value(&resp).expect("serialize"),
            json!({
                "id": 1,
                "result": { "type": "data", "data": "hello world" },
            })
        );
    }

    #[test]
    fn serialize_subscription_lifecycle() {
        assert_eq!(
            serde_json::to_value(Response::started(RequestId::String("sub".into())))
                .expect("serialize"),
            json!({ "id": "sub", "result": { "type": "started" } })
        );
        assert_eq!(
            serde_json::to_value(Response::stopped(RequestId::String("sub".into())))
                .expect("serialize"),
            json!({ "id": "sub", "result": { "type": "stopped" } })
        );
    }

    #[test]
    fn jsonrpc_tag_is_echoed_only_when_requested() {
        let resp = Response::data(RequestId::Number(2), json!(42)).with_jsonrpc(true);
        assert_eq!(
            serde_json::to_value(&resp).expect("serialize"),
            json!({ "jsonrpc": "2.0", "id": 2, "result": { "type": "data", "data": 42 } })
        );

        let resp = Response::data(RequestId::Number(2), json!(42)).with_jsonrpc(false);
        assert_eq!(
            serde_json::to_value(&resp).expect("serialize"),
            json!({ "id": 2, "result": { "type": "data", "data": 42 } })
        );
    }

    #[test]
    fn error_response_is_flattened() {
        let resp = Response::error(
            RequestId::Null,
            ResponseError {
                code: crate::ErrorCode::ParseError,
                status: 400,
                message: "the request could not be parsed".into(),
                data: None,
            },
        );

        let value = serde_json::to_value(&resp).expect("serialize");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], json!("ParseError"));
        assert_eq!(value["error"]["status"], json!(400));
    }

    #[test]
    fn incoming_message_distinguishes_notifications() {
        let msg: IncomingMessage =
            serde_json::from_value(json!({ "id": null, "method": "reconnect" }))
                .expect("deserialize");
        assert!(matches!(
            msg,
            IncomingMessage::Notification(NotificationMessage {
                method: NotificationMethod::Reconnect,
                ..
            })
        ));

        let msg: IncomingMessage = serde_json::from_value(
            json!({ "id": 4, "result": { "type": "data", "data": [1, 2, 3] } }),
        )
        .expect("deserialize");
        assert!(matches!(msg, IncomingMessage::Response(_)));
    }
}
