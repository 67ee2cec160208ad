use std::{borrow::Cow, sync::Arc};

use arpc::{
    internal::{
        exec::{handle_request, Sender, SubscriptionMap},
        jsonrpc::{Request as RpcRequest, RequestId, RequestInner, Response as RpcResponse},
        sse,
    },
    ExecError, ProcedureKind, ProcedureResult, Router,
};
use axum::{
    body::{to_bytes, Body},
    http::{header, request::Parts, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::StreamExt;
use serde_json::Value;

use crate::{Config, TCtxFunc};

pub(crate) async fn handle<TCtx, TMarker, TCtxFn>(
    router: Arc<Router<TCtx>>,
    ctx_fn: TCtxFn,
    config: Arc<Config>,
    path: String,
    req: axum::extract::Request,
) -> Response
where
    TCtx: Clone + Send + Sync + 'static,
    TMarker: Send + Sync + 'static,
    TCtxFn: TCtxFunc<TCtx, TMarker>,
{
    let (parts, body) = req.into_parts();

    let inner = match parts.method {
        Method::GET => {
            let input = match query_param(&parts, "input")
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
            {
                Ok(input) => input,
                Err(err) => {
                    return envelope_response(RpcResponse::error(
                        RequestId::Null,
                        router.format_error(ExecError::ParseError(err)),
                    ))
                }
            };

            if accepts_event_stream(&parts) {
                let last_event_id = query_param(&parts, "lastEventId")
                    .or_else(|| header_value(&parts, "Last-Event-ID"));

                let ctx = match ctx_fn.exec(parts).await {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        return envelope_response(RpcResponse::error(
                            RequestId::Null,
                            router.format_error(err),
                        ))
                    }
                };

                return handle_sse(router, ctx, config, path, input, last_event_id).await;
            }

            RequestInner::Query {
                path: Cow::Owned(path),
                input,
            }
        }
        Method::POST => {
            let input = match read_body_input(body).await {
                Ok(input) => input,
                Err(err) => {
                    return envelope_response(RpcResponse::error(
                        RequestId::Null,
                        router.format_error(err),
                    ))
                }
            };

            RequestInner::Mutation {
                path: Cow::Owned(path),
                input,
            }
        }
        _ => {
            return (StatusCode::METHOD_NOT_ALLOWED, ()).into_response();
        }
    };

    let ctx = match ctx_fn.exec(parts).await {
        Ok(ctx) => ctx,
        Err(err) => {
            return envelope_response(RpcResponse::error(
                RequestId::Null,
                router.format_error(err),
            ))
        }
    };

    let mut sender = Sender::Response(None);
    handle_request(
        ctx,
        RpcRequest {
            jsonrpc: None,
            id: RequestId::Null,
            inner,
        },
        &router,
        &mut sender,
        &SubscriptionMap::None,
    )
    .await;

    let resp = sender.into_response().unwrap_or_else(|| {
        RpcResponse::error(
            RequestId::Null,
            router.format_error(ExecError::UnreachableInternalState),
        )
    });

    envelope_response(resp)
}

async fn handle_sse<TCtx>(
    router: Arc<Router<TCtx>>,
    ctx: TCtx,
    config: Arc<Config>,
    path: String,
    input: Option<Value>,
    last_event_id: Option<String>,
) -> Response
where
    TCtx: Clone + Send + Sync + 'static,
{
    let input = merge_last_event_id(input, last_event_id);

    let stream = match router
        .execute(ctx, ProcedureKind::Subscription, &path, input)
        .await
    {
        Ok(ProcedureResult::Stream(stream)) => stream,
        Ok(ProcedureResult::Value(_)) => {
            return envelope_response(RpcResponse::error(
                RequestId::Null,
                router.format_error(ExecError::UnreachableInternalState),
            ))
        }
        Err(err) => {
            return envelope_response(RpcResponse::error(
                RequestId::Null,
                router.format_error(err),
            ))
        }
    };

    let events = futures::stream::unfold(Some(stream), move |state| {
        let router = router.clone();
        async move {
            let mut stream = state?;
            Some(match stream.next().await {
                Some(Ok(value)) => {
                    let mut event = Event::default();
                    if let Some(id) = arpc::event_id(&value) {
                        event = event.id(id);
                    }
                    (event.json_data(sse::EventPayload::Item(value)), Some(stream))
                }
                Some(Err(err)) => {
                    // A failed producer is terminal; the error is the last event.
                    let shape = router.format_error(ExecError::Resolver(err));
                    (
                        Event::default().json_data(sse::EventPayload::Error(shape)),
                        None,
                    )
                }
                None => (Ok(Event::default().data(sse::STOPPED)), None),
            })
        }
    });

    let max_duration = config.max_stream_duration;
    let events = events.take_until(Box::pin(async move {
        match max_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }));

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(config.keep_alive_interval)
                .text("ping"),
        )
        .into_response()
}

fn query_param(parts: &Parts, name: &str) -> Option<String> {
    parts
        .uri
        .query()
        .map(|query| form_urlencoded::parse(query.as_bytes()))
        .and_then(|mut pairs| pairs.find(|e| e.0 == name).map(|e| e.1.to_string()))
}

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn accepts_event_stream(parts: &Parts) -> bool {
    header_value(parts, "Accept").as_deref() == Some("text/event-stream")
}

async fn read_body_input(body: Body) -> Result<Option<Value>, ExecError> {
    let bytes = to_bytes(body, usize::MAX)
        .await
        .map_err(|_| ExecError::ExtractorError)?;

    if bytes.is_empty() {
        return Ok(None);
    }

    serde_json::from_slice(&bytes).map_err(ExecError::ParseError)
}

/// Stamp the resumption cursor into the procedure's input so a cursor-aware
/// producer can pick up after the last event the client saw.
fn merge_last_event_id(input: Option<Value>, last_event_id: Option<String>) -> Option<Value> {
    let Some(cursor) = last_event_id else {
        return input;
    };

    match input {
        None | Some(Value::Null) => Some(serde_json::json!({ "lastEventId": cursor })),
        Some(Value::Object(mut map)) => {
            map.insert("lastEventId".to_string(), Value::String(cursor));
            Some(Value::Object(map))
        }
        Some(other) => Some(other),
    }
}

pub(crate) fn envelope_response(resp: RpcResponse) -> Response {
    use arpc::internal::jsonrpc::ResponseInner;

    let status = match &resp.inner {
        ResponseInner::Error { error } => {
            StatusCode::from_u16(error.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
        ResponseInner::Result { .. } => StatusCode::OK,
    };

    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec(&resp).unwrap_or_default(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use arpc::{Error, ErrorCode};
    use axum::body::Bytes;
    use axum::http::{self, HeaderValue};
    use serde_json::json;

    use super::*;

    fn demo_router() -> Arc<Router<()>> {
        Router::builder()
            .query("version", |_, _: ()| async { Ok("0.1.0") })
            .mutation("double", |_, n: i32| async move { Ok(n * 2) })
            .query("error", |_, _: ()| async {
                Err::<(), _>(Error::new(ErrorCode::Unauthorized, "nope".into()))
            })
            .subscription("countdown", |_, from: u32| {
                async_stream::stream! {
                    for i in (0..=from).rev() {
                        yield Ok(i);
                    }
                }
            })
            .subscription("tracked_counter", |_, input: serde_json::Value| {
                let start = input
                    .get("lastEventId")
                    .and_then(|v| v.as_str())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|v| v + 1)
                    .unwrap_or(0);
                async_stream::stream! {
                    for i in start..start + 3 {
                        yield Ok(arpc::tracked(i.to_string(), i));
                    }
                }
            })
            .subscription("forever", |_, _: ()| {
                async_stream::stream! {
                    let mut i = 0u64;
                    loop {
                        yield Ok(i);
                        i += 1;
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            })
            .build()
            .expect("failed to build router")
            .arced()
    }

    async fn call(
        path: &str,
        req: http::request::Builder,
        body: Body,
        config: Config,
    ) -> (http::response::Parts, Bytes) {
        let req = req.body(body).expect("failed to build request");
        let resp = handle(
            demo_router(),
            || (),
            Arc::new(config),
            path.to_string(),
            req,
        )
        .await;

        let (parts, body) = resp.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.expect("failed to read body");
        (parts, bytes)
    }

    fn assert_json(parts: &http::response::Parts, body: Bytes) -> Value {
        assert_eq!(
            parts.headers.get("Content-Type"),
            Some(&HeaderValue::from_str("application/json").expect("header"))
        );
        serde_json::from_slice(&body).expect("invalid json body")
    }

    fn assert_sse(parts: &http::response::Parts, body: Bytes) -> Vec<(Option<String>, String)> {
        assert_eq!(
            parts.headers.get("Content-Type"),
            Some(&HeaderValue::from_str("text/event-stream").expect("header"))
        );

        std::str::from_utf8(&body)
            .expect("invalid utf8 body")
            .split("\n\n")
            .filter_map(|block| {
                let mut id = None;
                let mut data = None;
                for line in block.lines() {
                    if let Some(rest) = line.strip_prefix("id: ") {
                        id = Some(rest.to_string());
                    } else if let Some(rest) = line.strip_prefix("data: ") {
                        data = Some(rest.to_string());
                    }
                }
                data.map(|data| (id, data))
            })
            .collect()
    }

    #[tokio::test]
    async fn query_200() {
        let (parts, body) = call(
            "version",
            http::Request::builder().method("GET").uri("/version"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::OK);
        assert_eq!(body["result"], json!({ "type": "data", "data": "0.1.0" }));
    }

    #[tokio::test]
    async fn mutation_200() {
        let (parts, body) = call(
            "double",
            http::Request::builder().method("POST").uri("/double"),
            Body::from("21"),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::OK);
        assert_eq!(body["result"]["data"], json!(42));
    }

    #[tokio::test]
    async fn unknown_procedure_404() {
        let (parts, body) = call(
            "missing",
            http::Request::builder().method("GET").uri("/missing"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("NotFound"));
    }

    #[tokio::test]
    async fn kind_mismatch_404() {
        // `double` exists, but as a mutation.
        let (parts, _body) = call(
            "double",
            http::Request::builder().method("GET").uri("/double"),
            Body::empty(),
            Config::new(),
        )
        .await;

        assert_eq!(parts.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_input_400() {
        let (parts, body) = call(
            "version",
            http::Request::builder()
                .method("GET")
                .uri("/version?input=definitely-not-json"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], json!("ParseError"));
    }

    #[tokio::test]
    async fn resolver_error_propagates_status() {
        let (parts, body) = call(
            "error",
            http::Request::builder().method("GET").uri("/error"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["message"], json!("nope"));
    }

    #[tokio::test]
    async fn subscription_without_event_stream_is_not_found() {
        let (parts, body) = call(
            "countdown",
            http::Request::builder().method("GET").uri("/countdown"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let body = assert_json(&parts, body);
        assert_eq!(parts.status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("NotFound"));
    }

    #[tokio::test]
    async fn subscription_streams_events_in_order() {
        let (parts, body) = call(
            "countdown",
            http::Request::builder()
                .method("GET")
                .uri("/countdown?input=2")
                .header("Accept", "text/event-stream"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let events = assert_sse(&parts, body);
        let data: Vec<_> = events.iter().map(|(_, d)| d.as_str()).collect();
        assert_eq!(
            data,
            vec![
                r#"{"item":2}"#,
                r#"{"item":1}"#,
                r#"{"item":0}"#,
                "stopped"
            ]
        );
    }

    #[tokio::test]
    async fn tracked_events_resume_after_cursor() {
        let (parts, body) = call(
            "tracked_counter",
            http::Request::builder()
                .method("GET")
                .uri("/tracked_counter?lastEventId=4")
                .header("Accept", "text/event-stream"),
            Body::empty(),
            Config::new(),
        )
        .await;

        let events = assert_sse(&parts, body);
        let ids: Vec<_> = events.iter().filter_map(|(id, _)| id.as_deref()).collect();
        assert_eq!(ids, vec!["5", "6", "7"]);
    }

    #[tokio::test]
    async fn max_stream_duration_ends_the_stream() {
        let (parts, body) = call(
            "forever",
            http::Request::builder()
                .method("GET")
                .uri("/forever")
                .header("Accept", "text/event-stream"),
            Body::empty(),
            Config::new().max_stream_duration(std::time::Duration::from_millis(100)),
        )
        .await;

        // `to_bytes` returning at all proves the cutoff fired; the producer
        // itself never completes.
        let events = assert_sse(&parts, body);
        assert!(!events.is_empty());
        assert_ne!(events.last().map(|(_, d)| d.as_str()), Some("stopped"));
    }
}
