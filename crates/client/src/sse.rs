use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use arpc::internal::{jsonrpc::Response, sse};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{ClientError, Client};

/// Reconnection policy for an [`SseClient`].
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// A server-sent-events link: one subscription per HTTP connection.
///
/// The link records the id of every event it delivers. When the connection
/// drops (a network hiccup or the server's maximum stream duration) it
/// reconnects with backoff, sending the last seen id as the `lastEventId`
/// input field, and the producer resumes after that point: the caller sees
/// one gapless, duplicate-free stream across any number of reconnects.
#[derive(Debug, Clone)]
pub struct SseClient {
    url: String,
    client: reqwest::Client,
    config: SseConfig,
}

impl SseClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, SseConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: SseConfig) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .user_agent(concat!(
                    env!("CARGO_PKG_NAME"),
                    "/",
                    env!("CARGO_PKG_VERSION")
                ))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Start a subscription. Dropping the returned stream aborts the HTTP
    /// connection, which the server detects to run the subscription's
    /// cleanup.
    pub fn subscribe(&self, path: &str, input: Option<Value>) -> SseSubscription {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_subscription(
            self.client.clone(),
            Client::endpoint(&self.url, path),
            input,
            self.config.clone(),
            tx,
        ));

        SseSubscription { events: rx }
    }
}

/// An active SSE subscription; a [`Stream`] of server events.
pub struct SseSubscription {
    events: mpsc::UnboundedReceiver<Result<Value, ClientError>>,
}

impl Stream for SseSubscription {
    type Item = Result<Value, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

async fn run_subscription(
    client: reqwest::Client,
    url: String,
    input: Option<Value>,
    config: SseConfig,
    tx: mpsc::UnboundedSender<Result<Value, ClientError>>,
) {
    let mut last_event_id: Option<String> = None;
    let mut attempt = 0u32;

    loop {
        let mut req = client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(input) = &input {
            match serde_json::to_string(input) {
                Ok(raw) => req = req.query(&[("input", raw)]),
                Err(err) => {
                    let _ = tx.send(Err(ClientError::from(err)));
                    return;
                }
            }
        }
        if let Some(cursor) = &last_event_id {
            req = req.query(&[("lastEventId", cursor.clone())]);
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                let mut parser = EventParser::default();
                let mut body = resp.bytes_stream();

                'read: while let Some(chunk) = body.next().await {
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(_err) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!("sse stream dropped: {}", _err);
                            break 'read;
                        }
                    };

                    for frame in parser.feed(&chunk) {
                        if let Some(id) = frame.id {
                            last_event_id = Some(id);
                        }

                        let Some(data) = frame.data else { continue };
                        if data == sse::STOPPED {
                            // Natural completion, not a drop: don't resume.
                            return;
                        }

                        match serde_json::from_str::<sse::EventPayload>(&data) {
                            Ok(sse::EventPayload::Item(value)) => {
                                attempt = 0;
                                if tx.send(Ok(value)).is_err() {
                                    return;
                                }
                            }
                            Ok(sse::EventPayload::Error(error)) => {
                                // A failed producer is terminal.
                                let _ = tx.send(Err(ClientError::Response(error)));
                                return;
                            }
                            Err(_err) => {
                                #[cfg(feature = "tracing")]
                                tracing::error!("error decoding sse event: {}", _err);
                            }
                        }
                    }
                }
            }
            Ok(resp) => {
                // The subscription never started (unknown path, bad input,
                // rejected by middleware). That's fatal, not retryable.
                let err = match resp.json::<Response>().await {
                    Ok(envelope) => match crate::response_value(envelope) {
                        Err(err) => err,
                        Ok(_) => ClientError::UnexpectedResponse,
                    },
                    Err(err) => ClientError::from(err),
                };
                let _ = tx.send(Err(err));
                return;
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("sse connect failed: {}", _err);
            }
        }

        if tx.is_closed() {
            return;
        }

        // Dropped mid-stream (or the server's max duration elapsed): resume
        // from the last seen event id.
        let delay = config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(config.max_backoff);
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

/// One parsed SSE frame. Comment-only frames (keep-alive pings) are skipped
/// by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    id: Option<String>,
    data: Option<String>,
}

/// Incremental parser for the `id:`/`data:`/comment SSE framing. Frames can
/// arrive split across arbitrary chunk boundaries, including mid-codepoint,
/// so bytes are buffered and only complete blocks are decoded.
#[derive(Default)]
struct EventParser {
    buf: Vec<u8>,
}

impl EventParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend(chunk.iter().filter(|b| **b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(frame) = parse_block(&String::from_utf8_lossy(&block)) {
                frames.push(frame);
            }
        }

        frames
    }
}

fn parse_block(block: &str) -> Option<Frame> {
    let mut id = None;
    let mut data: Option<String> = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match &mut data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim_start_matches(' ').to_string());
        }
        // Anything else (comments, retry hints) is ignored.
    }

    (id.is_some() || data.is_some()).then_some(Frame { id, data })
}
