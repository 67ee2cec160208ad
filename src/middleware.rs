use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::{procedure::BoxHandler, Error, ProcedureResult, RequestContext};

/// One step in a procedure's middleware chain.
///
/// A middleware receives the context produced by the previous step and either
/// continues the chain (`Ok`, usually with an augmented context) or
/// short-circuits the call (`Err`), in which case the handler never runs.
/// The chain is an explicit ordered list interpreted by [`run_chain`], so a
/// step cannot invoke the rest of the chain twice or forget to invoke it; the
/// discriminated return value is the only way forward.
pub type Middleware<TCtx> = Arc<
    dyn Fn(TCtx, RequestContext) -> BoxFuture<'static, Result<TCtx, Error>> + Send + Sync + 'static,
>;

pub(crate) fn from_fn<TCtx, TFut, F>(func: F) -> Middleware<TCtx>
where
    TCtx: Send + 'static,
    F: Fn(TCtx, RequestContext) -> TFut + Send + Sync + 'static,
    TFut: std::future::Future<Output = Result<TCtx, Error>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(func(ctx, req)))
}

/// The trampoline: thread the context through each middleware in order, then
/// invoke the terminal handler with whatever context survived. Strictly
/// sequential within one call; distinct calls run as independent tasks and
/// interleave freely.
pub(crate) async fn run_chain<TCtx>(
    middleware: &[Middleware<TCtx>],
    mut ctx: TCtx,
    input: Value,
    req: RequestContext,
    handler: &BoxHandler<TCtx>,
) -> Result<ProcedureResult, Error>
where
    TCtx: Send + 'static,
{
    for mw in middleware {
        ctx = mw(ctx, req.clone()).await?;
    }

    handler(ctx, input, req).await
}
