use std::{convert::Infallible, sync::Arc};

use arpc::{
    internal::{
        exec::{handle_request, Sender, SubscriptionMap},
        jsonrpc::{BatchItem, Request as RpcRequest, RequestId, Response as RpcResponse},
    },
    ExecError, Router,
};
use axum::{
    body::{to_bytes, Body},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::{http::envelope_response, TCtxFunc};

/// Execute a JSON array of requests from one HTTP request.
///
/// Every call is spawned as its own task. With `Accept: application/jsonl`
/// the response body is newline-delimited JSON, each line written the moment
/// its call completes and tagged with the call's index, so a slow call never
/// holds up a fast one. Otherwise the responses are buffered into a single
/// JSON array in request order.
pub(crate) async fn handle<TCtx, TMarker, TCtxFn>(
    router: Arc<Router<TCtx>>,
    ctx_fn: TCtxFn,
    req: axum::extract::Request,
) -> Response
where
    TCtx: Clone + Send + Sync + 'static,
    TMarker: Send + Sync + 'static,
    TCtxFn: TCtxFunc<TCtx, TMarker>,
{
    let (parts, body) = req.into_parts();

    let streaming = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "application/jsonl")
        .unwrap_or_default();

    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error reading batch request body: {}", _err);

            return envelope_response(RpcResponse::error(
                RequestId::Null,
                router.format_error(ExecError::ExtractorError),
            ));
        }
    };

    let reqs: Vec<RpcRequest> = match serde_json::from_slice(&bytes) {
        Ok(reqs) => reqs,
        Err(err) => {
            return envelope_response(RpcResponse::error(
                RequestId::Null,
                router.format_error(ExecError::ParseError(err)),
            ))
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

    if streaming {
        let (tx, rx) = futures::channel::mpsc::unbounded();

        for (index, req) in reqs.into_iter().enumerate() {
            let router = router.clone();
            let ctx = ctx.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let response = exec_one(&router, ctx, req).await;
                match serde_json::to_vec(&BatchItem { index, response }) {
                    Ok(mut line) => {
                        line.push(b'\n');
                        let _ = tx.unbounded_send(Ok::<_, Infallible>(line));
                    }
                    Err(_err) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("error serializing batch response: {}", _err);
                    }
                }
            });
        }

        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/jsonl")],
            Body::from_stream(rx),
        )
            .into_response();
    }

    let mut handles = Vec::with_capacity(reqs.len());
    for req in reqs {
        let router = router.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(
            async move { exec_one(&router, ctx, req).await },
        ));
    }

    let mut responses = Vec::with_capacity(handles.len());
    for handle in handles {
        responses.push(handle.await.unwrap_or_else(|_| {
            RpcResponse::error(
                RequestId::Null,
                router.format_error(ExecError::UnreachableInternalState),
            )
        }));
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::to_vec(&responses).unwrap_or_default(),
    )
        .into_response()
}

async fn exec_one<TCtx>(router: &Arc<Router<TCtx>>, ctx: TCtx, req: RpcRequest) -> RpcResponse
where
    TCtx: Clone + Send + Sync + 'static,
{
    let mut sender = Sender::Response(None);
    handle_request(ctx, req, router, &mut sender, &SubscriptionMap::None).await;

    sender.into_response().unwrap_or_else(|| {
        RpcResponse::error(
            RequestId::Null,
            router.format_error(ExecError::UnreachableInternalState),
        )
    })
}
