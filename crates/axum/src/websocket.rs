use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use arpc::{
    internal::{
        exec::{handle_request, new_subscription_set, Sender, SubscriptionMap},
        jsonrpc::{self, NotificationMessage, Request as RpcRequest, RequestId, RequestInner},
    },
    ExecError, Router,
};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use nanoid::nanoid;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::TCtxFunc;

/// The live WebSocket sessions of one endpoint.
///
/// Owned by the endpoint (handed in via [`Config::connections`]) rather than
/// any global state; its lifecycle is the server's lifecycle. The application
/// keeps a clone to ask every connected client to reconnect, e.g. just before
/// a redeploy.
///
/// [`Config::connections`]: crate::Config::connections
#[derive(Debug, Clone, Default)]
pub struct Connections(Arc<Mutex<HashMap<String, mpsc::UnboundedSender<NotificationMessage>>>>);

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a `reconnect` notification (`id: null`) to every live session.
    /// Clients drop their socket, reopen it with backoff and replay their
    /// active subscriptions.
    pub fn broadcast_reconnect(&self) {
        for tx in self.0.lock().expect("connection registry poisoned").values() {
            let _ = tx.send(NotificationMessage::reconnect());
        }
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("connection registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, id: String, tx: mpsc::UnboundedSender<NotificationMessage>) {
        self.0
            .lock()
            .expect("connection registry poisoned")
            .insert(id, tx);
    }

    fn remove(&self, id: &str) {
        self.0
            .lock()
            .expect("connection registry poisoned")
            .remove(id);
    }
}

pub(crate) async fn handle<TCtx, TMarker, TCtxFn>(
    router: Arc<Router<TCtx>>,
    ctx_fn: TCtxFn,
    connections: Connections,
    ws: WebSocketUpgrade,
    req: axum::extract::Request,
) -> Response
where
    TCtx: Clone + Send + Sync + 'static,
    TMarker: Send + Sync + 'static,
    TCtxFn: TCtxFunc<TCtx, TMarker>,
{
    let (parts, _body) = req.into_parts();

    let ctx = match ctx_fn.exec(parts).await {
        Ok(ctx) => ctx,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error executing context function: {}", _err);

            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| run_connection(router, ctx, connections, socket))
}

async fn run_connection<TCtx>(
    router: Arc<Router<TCtx>>,
    ctx: TCtx,
    connections: Connections,
    mut socket: WebSocket,
) where
    TCtx: Clone + Send + Sync + 'static,
{
    #[cfg(feature = "tracing")]
    tracing::debug!("accepting websocket connection");

    let conn_id = nanoid!();
    let (mut tx, mut rx) = mpsc::unbounded_channel::<jsonrpc::Response>();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<NotificationMessage>();
    connections.insert(conn_id.clone(), notify_tx);

    let subscriptions = new_subscription_set();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&router, &ctx, &mut tx, &subscriptions, text.as_bytes()).await;
                    }
                    Some(Ok(Message::Binary(binary))) => {
                        handle_frame(&router, &ctx, &mut tx, &subscriptions, &binary).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_err)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("error reading from websocket connection: {}", _err);
                        break;
                    }
                }
            }
            Some(resp) = rx.recv() => {
                if send_json(&mut socket, &resp).await.is_err() {
                    break;
                }
            }
            Some(notification) = notify_rx.recv() => {
                if send_json(&mut socket, &notification).await.is_err() {
                    break;
                }
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!("shutting down websocket connection");

    connections.remove(&conn_id);

    // Terminate every active subscription exactly once.
    for (_, shutdown) in subscriptions
        .lock()
        .expect("subscription map poisoned")
        .drain()
    {
        let _ = shutdown.send(());
    }
}

/// Parse one text/binary frame (a single request or an array of them) and
/// execute it. A frame that isn't valid JSON gets a single `ParseError`
/// response with `id: null` and the socket stays open.
async fn handle_frame<TCtx>(
    router: &Arc<Router<TCtx>>,
    ctx: &TCtx,
    tx: &mut mpsc::UnboundedSender<jsonrpc::Response>,
    subscriptions: &arpc::internal::exec::SubscriptionSet,
    frame: &[u8],
) where
    TCtx: Clone + Send + Sync + 'static,
{
    let reqs = serde_json::from_slice::<Value>(frame).and_then(|v| match v.is_array() {
        true => serde_json::from_value::<Vec<RpcRequest>>(v),
        false => serde_json::from_value::<RpcRequest>(v).map(|v| vec![v]),
    });

    match reqs {
        Ok(reqs) => {
            for req in reqs {
                match req.inner {
                    // Queries and mutations run as their own tasks so a slow
                    // call never stalls the socket; responses are correlated
                    // by id, not arrival order.
                    RequestInner::Query { .. } | RequestInner::Mutation { .. } => {
                        let router = router.clone();
                        let ctx = ctx.clone();
                        let mut tx = tx.clone();
                        tokio::spawn(async move {
                            let mut sender = Sender::ResponseChannel(&mut tx);
                            handle_request(ctx, req, &router, &mut sender, &SubscriptionMap::None)
                                .await;
                        });
                    }
                    // Subscription lifecycle stays on the event loop so a
                    // subscribe and its stop can't race each other.
                    RequestInner::Subscription { .. } | RequestInner::SubscriptionStop => {
                        let mut sender = Sender::ResponseChannel(&mut *tx);
                        handle_request(
                            ctx.clone(),
                            req,
                            router,
                            &mut sender,
                            &SubscriptionMap::Shared(subscriptions),
                        )
                        .await;
                    }
                }
            }
        }
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error parsing websocket message: {}", err);

            let _ = tx.send(jsonrpc::Response::error(
                RequestId::Null,
                router.format_error(ExecError::ParseError(err)),
            ));
        }
    }
}

async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), ()> {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error serializing websocket message: {}", _err);
            return Ok(());
        }
    };

    socket.send(Message::Text(text.into())).await.map_err(|_err| {
        #[cfg(feature = "tracing")]
        tracing::error!("error sending message to websocket: {}", _err);
    })
}
