//! Integrate arpc with an [Axum](https://docs.rs/axum/latest/axum/) HTTP server so it can be accessed from your frontend.
//!
//! The endpoint exposes:
//!  - `GET /{path}`: execute a query (`input` URL parameter), or open an SSE
//!    stream for a subscription when the request accepts `text/event-stream`
//!  - `POST /{path}`: execute a mutation (JSON body)
//!  - `POST /_batch`: execute many calls at once; responses stream back
//!    tagged by index as soon as each call finishes
//!  - `GET /ws`: the WebSocket transport (feature `ws`)
#![warn(
    clippy::all,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::panic,
    clippy::todo,
    clippy::panic_in_result_fn,
    // missing_docs
)]
#![forbid(unsafe_code)]
#![allow(clippy::module_inception)]
#![cfg_attr(docsrs, feature(doc_cfg))]

use std::{sync::Arc, time::Duration};

use arpc::Router;
use axum::routing::{on, MethodFilter};

mod batch;
mod extractors;
mod http;
#[cfg(feature = "ws")]
#[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
mod websocket;

pub use extractors::*;
#[cfg(feature = "ws")]
#[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
pub use websocket::Connections;

/// Transport configuration for an [`endpoint`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) keep_alive_interval: Duration,
    pub(crate) max_stream_duration: Option<Duration>,
    #[cfg(feature = "ws")]
    pub(crate) connections: Connections,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(5),
            max_stream_duration: None,
            #[cfg(feature = "ws")]
            connections: Connections::new(),
        }
    }

    /// How often to send an SSE keep-alive comment so intermediaries don't
    /// drop an idle stream.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// End every SSE stream after this long. Clients resume from their last
    /// seen event id, so long-lived subscriptions survive the cutoff.
    pub fn max_stream_duration(mut self, duration: Duration) -> Self {
        self.max_stream_duration = Some(duration);
        self
    }

    /// Share a [`Connections`] registry with the endpoint so the application
    /// can broadcast reconnect requests to every WebSocket client.
    #[cfg(feature = "ws")]
    #[cfg_attr(docsrs, doc(cfg(feature = "ws")))]
    pub fn connections(mut self, connections: Connections) -> Self {
        self.connections = connections;
        self
    }
}

pub fn endpoint<TCtx, TMarker, TCtxFn>(
    router: Arc<Router<TCtx>>,
    ctx_fn: TCtxFn,
) -> axum::Router
where
    TCtx: Clone + Send + Sync + 'static,
    TMarker: Send + Sync + 'static,
    TCtxFn: TCtxFunc<TCtx, TMarker>,
{
    endpoint_with(router, ctx_fn, Config::new())
}

pub fn endpoint_with<TCtx, TMarker, TCtxFn>(
    router: Arc<Router<TCtx>>,
    ctx_fn: TCtxFn,
    config: Config,
) -> axum::Router
where
    TCtx: Clone + Send + Sync + 'static,
    TMarker: Send + Sync + 'static,
    TCtxFn: TCtxFunc<TCtx, TMarker>,
{
    let config = Arc::new(config);

    let r = axum::Router::new().route("/_batch", {
        let router = router.clone();
        let ctx_fn = ctx_fn.clone();
        axum::routing::post(move |req: axum::extract::Request| {
            let router = router.clone();
            let ctx_fn = ctx_fn.clone();
            async move { batch::handle(router, ctx_fn, req).await }
        })
    });

    #[cfg(feature = "ws")]
    let r = r.route("/ws", {
        let router = router.clone();
        let ctx_fn = ctx_fn.clone();
        let connections = config.connections.clone();
        axum::routing::get(
            move |ws: axum::extract::ws::WebSocketUpgrade, req: axum::extract::Request| {
                let router = router.clone();
                let ctx_fn = ctx_fn.clone();
                let connections = connections.clone();
                async move { websocket::handle(router, ctx_fn, connections, ws, req).await }
            },
        )
    });

    r.route("/{path}", {
        on(
            MethodFilter::GET.or(MethodFilter::POST),
            move |path: axum::extract::Path<String>, req: axum::extract::Request| {
                let router = router.clone();
                let ctx_fn = ctx_fn.clone();
                let config = config.clone();
                async move { http::handle(router, ctx_fn, config, path.0, req).await }
            },
        )
    })
}
