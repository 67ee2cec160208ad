use std::{borrow::Cow, time::Duration};

use arpc::internal::jsonrpc::{BatchItem, Request, RequestId, RequestInner, Response};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::{response_value, Client, ClientError};

/// Time to wait for more calls before sending a batch.
const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(10);

type Reply = oneshot::Sender<Result<Value, ClientError>>;

struct PendingCall {
    inner: RequestInner,
    reply: Reply,
}

/// Coalesces calls issued within a scheduling window into one
/// `POST /_batch` request.
///
/// The server streams each response back the moment it is ready, tagged with
/// the index of the call it answers; the link demultiplexes them to the
/// right caller, so one slow call never delays the others. The grouping
/// window is a plain duration armed when the first call of a batch is
/// enqueued, not anything scheduler-specific; only the
/// index-correctness and non-blocking behavior matter.
#[derive(Debug, Clone)]
pub struct BatchLink {
    tx: mpsc::UnboundedSender<PendingCall>,
}

impl BatchLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_window(url, DEFAULT_BATCH_WINDOW)
    }

    pub fn with_window(url: impl Into<String>, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = reqwest::Client::builder()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .unwrap_or_default();

        tokio::spawn(run_batcher(client, url.into(), window, rx));

        Self { tx }
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

    async fn call(&self, inner: RequestInner) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingCall { inner, reply })
            .map_err(|_| ClientError::Closed)?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

async fn run_batcher(
    client: reqwest::Client,
    url: String,
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<PendingCall>,
) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];

        // Collect everything issued before the window elapses.
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(call)) => batch.push(call),
                Ok(None) | Err(_) => break,
            }
        }

        // Flushing must not hold up the next window.
        tokio::spawn(flush(client.clone(), url.clone(), batch));
    }
}

async fn flush(client: reqwest::Client, url: String, batch: Vec<PendingCall>) {
    let mut requests = Vec::with_capacity(batch.len());
    let mut replies: Vec<Option<Reply>> = Vec::with_capacity(batch.len());
    for call in batch {
        requests.push(Request {
            jsonrpc: None,
            id: RequestId::Null,
            inner: call.inner,
        });
        replies.push(Some(call.reply));
    }

    let resp = client
        .post(Client::endpoint(&url, "_batch"))
        .header(reqwest::header::ACCEPT, "application/jsonl")
        .json(&requests)
        .send()
        .await;

    let resp = match resp {
        Ok(resp) => resp,
        Err(err) => return fail_all(replies, ClientError::from(err)),
    };

    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return fail_all(replies, ClientError::from(err)),
        };

        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if !line.is_empty() {
                deliver_line(line, &mut replies);
            }
        }
    }

    // Anything left without a trailing newline: a buffered-mode array or a
    // whole-batch error envelope.
    let rest: &[u8] = &buf;
    if !rest.iter().all(u8::is_ascii_whitespace) {
        if let Ok(responses) = serde_json::from_slice::<Vec<Response>>(rest) {
            for (index, response) in responses.into_iter().enumerate() {
                deliver(index, response, &mut replies);
            }
        } else if let Ok(response) = serde_json::from_slice::<Response>(rest) {
            // A whole-batch failure (e.g. the request body failed to parse)
            // applies uniformly to every call in it.
            let err = match response_value(response) {
                Err(err) => err,
                Ok(_) => ClientError::UnexpectedResponse,
            };
            return fail_all(replies, err);
        } else {
            deliver_line(rest, &mut replies);
        }
    }

    // A transport that ends without answering a call is an error for that
    // call, never a silent drop.
    fail_all(replies, ClientError::MissingResponse);
}

fn deliver_line(line: &[u8], replies: &mut [Option<Reply>]) {
    match serde_json::from_slice::<BatchItem>(line) {
        Ok(item) => deliver(item.index, item.response, replies),
        Err(_err) => {
            #[cfg(feature = "tracing")]
            tracing::error!("error decoding batch response frame: {}", _err);
        }
    }
}

fn deliver(index: usize, response: Response, replies: &mut [Option<Reply>]) {
    if let Some(reply) = replies.get_mut(index).and_then(Option::take) {
        let _ = reply.send(response_value(response));
    }
}

fn fail_all(mut replies: Vec<Option<Reply>>, err: ClientError) {
    for reply in replies.iter_mut().filter_map(Option::take) {
        let _ = reply.send(Err(err.clone()));
    }
}
