use std::{future::Future, marker::PhantomData};

use arpc::ExecError;
use axum::{extract::FromRequestParts, http::request::Parts};

/// Builds the request context handed to every procedure.
///
/// Implemented for `Fn() -> TCtx` and for `Fn(E) -> TCtx` where `E` is any
/// axum extractor that works from request parts.
pub trait TCtxFunc<TCtx, TMarker>: Clone + Send + Sync + 'static {
    fn exec(&self, parts: Parts) -> impl Future<Output = Result<TCtx, ExecError>> + Send;
}

pub struct NoArgMarker(PhantomData<()>);

impl<TCtx, TFunc> TCtxFunc<TCtx, NoArgMarker> for TFunc
where
    TCtx: Send + 'static,
    TFunc: FnOnce() -> TCtx + Clone + Send + Sync + 'static,
{
    async fn exec(&self, _parts: Parts) -> Result<TCtx, ExecError> {
        Ok(self.clone()())
    }
}

pub struct SingleArgMarker<E1>(PhantomData<E1>);

impl<TCtx, TFunc, E1> TCtxFunc<TCtx, SingleArgMarker<E1>> for TFunc
where
    TCtx: Send + 'static,
    E1: FromRequestParts<()> + Send + 'static,
    TFunc: FnOnce(E1) -> TCtx + Clone + Send + Sync + 'static,
{
    async fn exec(&self, mut parts: Parts) -> Result<TCtx, ExecError> {
        let extracted = E1::from_request_parts(&mut parts, &())
            .await
            .map_err(|_| ExecError::ExtractorError)?;
        Ok(self.clone()(extracted))
    }
}
