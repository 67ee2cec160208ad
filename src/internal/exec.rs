//! Protocol-agnostic execution of a single wire request.
//!
//! Transports parse frames into [`jsonrpc::Request`]s and hand them to
//! [`handle_request`] together with somewhere to send responses and (for
//! transports that support subscriptions) the connection's subscription map.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

use crate::{
    internal::jsonrpc::{self, Request, RequestId, RequestInner, Response},
    ExecError, ProcedureKind, ProcedureResult, Router,
};

/// The active subscriptions of one connection, keyed by request id.
///
/// The map is shared between the connection's event loop and the per-
/// subscription forwarding tasks: a task removes its own entry when it
/// terminates, and dropping the map (connection closed) wakes every task's
/// shutdown receiver.
pub type SubscriptionSet = Arc<Mutex<HashMap<RequestId, oneshot::Sender<()>>>>;

pub fn new_subscription_set() -> SubscriptionSet {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Where a connection keeps its subscriptions, or [`SubscriptionMap::None`] for
/// transports that can't push unsolicited messages to the client.
pub enum SubscriptionMap<'a> {
    Shared(&'a SubscriptionSet),
    None,
}

impl SubscriptionMap<'_> {
    fn has_subscription(&self, id: &RequestId) -> bool {
        match self {
            SubscriptionMap::Shared(set) => {
                set.lock().expect("subscription map poisoned").contains_key(id)
            }
            SubscriptionMap::None => false,
        }
    }

    fn remove(&self, id: &RequestId) -> Option<oneshot::Sender<()>> {
        match self {
            SubscriptionMap::Shared(set) => {
                set.lock().expect("subscription map poisoned").remove(id)
            }
            SubscriptionMap::None => None,
        }
    }
}

/// Where responses for the current request go.
pub enum Sender<'a> {
    /// A persistent connection's outgoing queue.
    ResponseChannel(&'a mut mpsc::UnboundedSender<Response>),
    /// A single-response transport; the response is stored for the caller.
    Response(Option<Response>),
}

impl Sender<'_> {
    fn send(&mut self, resp: Response) {
        match self {
            Self::ResponseChannel(tx) => {
                let _ = tx.send(resp).map_err(|_err| {
                    #[cfg(feature = "tracing")]
                    tracing::error!("failed to send response: {}", _err);
                });
            }
            Self::Response(slot) => {
                *slot = Some(resp);
            }
        }
    }

    /// Take the buffered response of a [`Sender::Response`].
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(resp) => resp,
            Self::ResponseChannel(_) => None,
        }
    }
}

/// Execute one request and push its response(s) into `sender`.
///
/// Subscriptions spawn a forwarding task and return immediately; everything
/// else produces exactly one response before this function returns. Errors
/// never escape: they are formatted once and sent as error responses.
pub async fn handle_request<TCtx>(
    ctx: TCtx,
    req: Request,
    router: &Arc<Router<TCtx>>,
    sender: &mut Sender<'_>,
    subscriptions: &SubscriptionMap<'_>,
) where
    TCtx: Send + 'static,
{
    let jsonrpc_requested = req.jsonrpc.is_some();
    if jsonrpc_requested && req.jsonrpc.as_deref() != Some("2.0") {
        sender.send(
            Response::error(req.id, router.format_error(ExecError::InvalidJsonRpcVersion))
                .with_jsonrpc(true),
        );
        return;
    }

    let (kind, path, input) = match req.inner {
        RequestInner::Query { path, input } => (ProcedureKind::Query, path, input),
        RequestInner::Mutation { path, input } => (ProcedureKind::Mutation, path, input),
        RequestInner::Subscription { path, input } => {
            let id = req.id;
            if matches!(id, RequestId::Null) {
                sender.send(
                    Response::error(
                        id,
                        router.format_error(ExecError::ErrSubscriptionWithNullId),
                    )
                    .with_jsonrpc(jsonrpc_requested),
                );
                return;
            }

            let (set, response_tx) = match (subscriptions, &*sender) {
                (SubscriptionMap::Shared(set), Sender::ResponseChannel(tx)) => {
                    ((*set).clone(), (*tx).clone())
                }
                _ => {
                    sender.send(
                        Response::error(
                            id,
                            router.format_error(ExecError::ErrSubscriptionsNotSupported),
                        )
                        .with_jsonrpc(jsonrpc_requested),
                    );
                    return;
                }
            };

            if subscriptions.has_subscription(&id) {
                sender.send(
                    Response::error(
                        id,
                        router.format_error(ExecError::ErrSubscriptionDuplicateId),
                    )
                    .with_jsonrpc(jsonrpc_requested),
                );
                return;
            }

            match router
                .execute(ctx, ProcedureKind::Subscription, &path, input)
                .await
            {
                Ok(ProcedureResult::Stream(stream)) => {
                    let (shutdown_tx, shutdown_rx) = oneshot::channel();
                    set.lock()
                        .expect("subscription map poisoned")
                        .insert(id.clone(), shutdown_tx);

                    // The ack must reach the client before the first event;
                    // both travel the same queue so order is preserved.
                    sender.send(Response::started(id.clone()).with_jsonrpc(jsonrpc_requested));

                    spawn_subscription(
                        router.clone(),
                        set,
                        id,
                        stream,
                        response_tx,
                        shutdown_rx,
                        jsonrpc_requested,
                    );
                }
                Ok(ProcedureResult::Value(_)) => sender.send(
                    Response::error(
                        id,
                        router.format_error(ExecError::UnreachableInternalState),
                    )
                    .with_jsonrpc(jsonrpc_requested),
                ),
                Err(err) => sender.send(
                    Response::error(id, router.format_error(err)).with_jsonrpc(jsonrpc_requested),
                ),
            }

            return;
        }
        RequestInner::SubscriptionStop => {
            if let Some(shutdown) = subscriptions.remove(&req.id) {
                let _ = shutdown.send(());
            }
            return;
        }
    };

    let resp = match router.execute(ctx, kind, &path, input).await {
        Ok(ProcedureResult::Value(value)) => Response::data(req.id, value),
        Ok(ProcedureResult::Stream(_)) => Response::error(
            req.id,
            router.format_error(ExecError::UnreachableInternalState),
        ),
        Err(err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error executing {} '{}': {}", kind.to_str(), path, err);

            Response::error(req.id, router.format_error(err))
        }
    };

    sender.send(resp.with_jsonrpc(jsonrpc_requested));
}

fn spawn_subscription<TCtx>(
    router: Arc<Router<TCtx>>,
    set: SubscriptionSet,
    id: RequestId,
    mut stream: crate::SubscriptionStream,
    tx: mpsc::UnboundedSender<jsonrpc::Response>,
    mut shutdown_rx: oneshot::Receiver<()>,
    jsonrpc_requested: bool,
) where
    TCtx: Send + 'static,
{
    tokio::spawn(async move {
        let terminal = loop {
            tokio::select! {
                biased; // Note: Order matters
                _ = &mut shutdown_rx => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("removing subscription with id '{:?}'", id);
                    break Some(Response::stopped(id.clone()));
                }
                v = stream.next() => {
                    match v {
                        Some(Ok(value)) => {
                            if tx
                                .send(Response::data(id.clone(), value).with_jsonrpc(jsonrpc_requested))
                                .is_err()
                            {
                                // Connection gone; nobody left to tell.
                                break None;
                            }
                        }
                        Some(Err(err)) => {
                            break Some(Response::error(
                                id.clone(),
                                router.format_error(ExecError::Resolver(err)),
                            ));
                        }
                        None => break Some(Response::stopped(id.clone())),
                    }
                }
            }
        };

        if let Some(resp) = terminal {
            let _ = tx.send(resp.with_jsonrpc(jsonrpc_requested));
        }

        // Idempotent: the entry is already gone if a stop request got here first.
        set.lock().expect("subscription map poisoned").remove(&id);
    });
}
