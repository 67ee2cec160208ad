use std::{
    borrow::Cow,
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use arpc::internal::jsonrpc::{
    IncomingMessage, NotificationMethod, Request, RequestId, RequestInner, ResponseInner,
    ResultPayload,
};
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::{response_value, ClientError};

/// Reconnection and keepalive policy for a [`WsClient`].
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub keep_alive_interval: Option<Duration>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            keep_alive_interval: None,
        }
    }
}

fn backoff_delay(config: &WsConfig, attempt: u32) -> Duration {
    let exp = config
        .initial_backoff
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    exp.min(config.max_backoff)
}

type Reply = oneshot::Sender<Result<Value, ClientError>>;
type EventSender = mpsc::UnboundedSender<Result<Value, ClientError>>;

enum Command {
    Call {
        id: u32,
        inner: RequestInner,
        reply: Reply,
    },
    Subscribe {
        id: u32,
        path: String,
        input: Option<Value>,
        events: EventSender,
    },
    Unsubscribe {
        id: u32,
    },
    Close,
}

/// A persistent-connection link.
///
/// One socket carries any number of concurrent queries, mutations and
/// subscriptions, correlated by numeric id. When the socket drops (or the
/// server broadcasts a reconnect request) the client reconnects with
/// exponential backoff and replays every active subscription. Calls that
/// were in flight at the moment of disconnect are rejected with
/// [`ClientError::ConnectionClosed`], never silently dropped and never
/// retried, so a mutation executes at most once. Calls issued while
/// disconnected are held and sent once the connection is back.
#[derive(Debug, Clone)]
pub struct WsClient {
    cmd: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

impl WsClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, WsConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: WsConfig) -> Self {
        let (cmd, cmd_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_driver(url.into(), config, cmd_rx, closed.clone()));

        Self {
            cmd,
            next_id: Arc::new(AtomicU32::new(0)),
            closed,
        }
    }

    pub async fn query(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        self.call(RequestInner::Query {
            path: Cow::Owned(path.to_string()),
            input,
        })
        .await
    }

    pub async fn mutation(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        self.call(RequestInner::Mutation {
            path: Cow::Owned(path.to_string()),
            input,
        })
        .await
    }

    /// Start a subscription. The returned stream yields every event the
    /// server emits, in production order; dropping it unsubscribes.
    pub fn subscribe(&self, path: &str, input: Option<Value>) -> WsSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (events, rx) = mpsc::unbounded_channel();

        let _ = self.cmd.send(Command::Subscribe {
            id,
            path: path.to_string(),
            input,
            events,
        });

        WsSubscription {
            id,
            events: rx,
            cmd: self.cmd.clone(),
        }
    }

    /// Permanently close the connection and stop the reconnect loop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let _ = self.cmd.send(Command::Close);
    }

    async fn call(&self, inner: RequestInner) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        self.cmd
            .send(Command::Call { id, inner, reply })
            .map_err(|_| ClientError::Closed)?;

        rx.await.map_err(|_| ClientError::Closed)?
    }
}

/// An active subscription; a [`Stream`] of server events.
pub struct WsSubscription {
    id: u32,
    events: mpsc::UnboundedReceiver<Result<Value, ClientError>>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl Stream for WsSubscription {
    type Item = Result<Value, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for WsSubscription {
    fn drop(&mut self) {
        let _ = self.cmd.send(Command::Unsubscribe { id: self.id });
    }
}

struct SubEntry {
    path: String,
    input: Option<Value>,
    events: EventSender,
}

async fn run_driver(
    url: String,
    config: WsConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    closed: Arc<AtomicBool>,
) {
    let mut pending: HashMap<u32, Reply> = HashMap::new();
    let mut subs: HashMap<u32, SubEntry> = HashMap::new();
    let mut attempt = 0u32;

    'outer: loop {
        if closed.load(Ordering::Relaxed) {
            break;
        }

        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("websocket connect failed (attempt {}): {}", attempt, _err);

                tokio::time::sleep(backoff_delay(&config, attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };
        attempt = 0;

        let (mut sink, mut stream) = socket.split();

        // Replay every subscription that was active before the reconnect,
        // under its original id, so the caller's stream just keeps going.
        let mut replayed = true;
        for (id, sub) in subs.iter() {
            let req = subscription_request(*id, sub);
            if send_frame(&mut sink, &req).await.is_err() {
                replayed = false;
                break;
            }
        }
        if !replayed {
            continue;
        }

        let mut keepalive = tokio::time::interval(
            config
                .keep_alive_interval
                .unwrap_or(Duration::from_secs(86_400)),
        );
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Call { id, inner, reply }) => {
                        pending.insert(id, reply);
                        let req = Request { jsonrpc: None, id: RequestId::Number(id), inner };
                        if send_frame(&mut sink, &req).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Subscribe { id, path, input, events }) => {
                        let entry = SubEntry { path, input, events };
                        let req = subscription_request(id, &entry);
                        subs.insert(id, entry);
                        if send_frame(&mut sink, &req).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Unsubscribe { id }) => {
                        // Removing the entry stops delivery immediately; the
                        // stop request lets the server clean up.
                        if subs.remove(&id).is_some() {
                            let req = Request {
                                jsonrpc: None,
                                id: RequestId::Number(id),
                                inner: RequestInner::SubscriptionStop,
                            };
                            if send_frame(&mut sink, &req).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break 'outer;
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_message(&text, &mut pending, &mut subs) {
                            #[cfg(feature = "tracing")]
                            tracing::debug!("server requested a reconnect");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_err)) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("websocket read error: {}", _err);
                        break;
                    }
                },
                _ = keepalive.tick() => {
                    if config.keep_alive_interval.is_some()
                        && sink.send(Message::Ping(vec![])).await.is_err()
                    {
                        break;
                    }
                }
            }
        }

        if closed.load(Ordering::Relaxed) {
            break;
        }

        // The connection is gone. In-flight calls are rejected (at most once
        // delivery: we can't know whether the server saw them); active
        // subscriptions stay around for replay.
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ClientError::Closed));
    }
    subs.clear();
}

fn subscription_request(id: u32, sub: &SubEntry) -> Request {
    Request {
        jsonrpc: None,
        id: RequestId::Number(id),
        inner: RequestInner::Subscription {
            path: Cow::Owned(sub.path.clone()),
            input: sub.input.clone(),
        },
    }
}

async fn send_frame<S>(sink: &mut S, req: &Request) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let text = match serde_json::to_string(req) {
        Ok(text) => text,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error serializing websocket request: {}", _err);
            return Ok(());
        }
    };

    sink.send(Message::Text(text)).await.map_err(|_| ())
}

/// Dispatch one incoming frame. Returns `true` when the server asked us to
/// reconnect.
fn handle_message(
    text: &str,
    pending: &mut HashMap<u32, Reply>,
    subs: &mut HashMap<u32, SubEntry>,
) -> bool {
    let msg = match serde_json::from_str::<IncomingMessage>(text) {
        Ok(msg) => msg,
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error parsing websocket frame: {}", _err);
            return false;
        }
    };

    let resp = match msg {
        IncomingMessage::Notification(notification) => {
            return matches!(notification.method, NotificationMethod::Reconnect);
        }
        IncomingMessage::Response(resp) => resp,
    };

    let id = match resp.id {
        RequestId::Number(id) => id,
        // Server-side errors not tied to any call (e.g. our frame failed to
        // parse) have nowhere useful to go.
        _ => {
            #[cfg(feature = "tracing")]
            tracing::error!("received response with unroutable id: {:?}", resp);
            return false;
        }
    };

    if let Some(reply) = pending.remove(&id) {
        let _ = reply.send(response_value(resp));
        return false;
    }

    let terminal = match subs.get(&id) {
        Some(sub) => match resp.inner {
            ResponseInner::Result {
                result: ResultPayload::Started,
            } => false,
            ResponseInner::Result {
                result: ResultPayload::Data(value),
            } => sub.events.send(Ok(value)).is_err(),
            ResponseInner::Result {
                result: ResultPayload::Stopped,
            } => true,
            ResponseInner::Error { error } => {
                let _ = sub.events.send(Err(ClientError::Response(error)));
                true
            }
        },
        None => false,
    };

    if terminal {
        subs.remove(&id);
    }

    false
}
