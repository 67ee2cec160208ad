use std::{borrow::Cow, fmt, pin::Pin};

use futures::{future::BoxFuture, FutureExt, Stream};
use serde_json::Value;

use crate::{Error, ExecError, Middleware};

/// The kind of a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Query,
    Mutation,
    Subscription,
}

impl ProcedureKind {
    pub fn to_str(&self) -> &'static str {
        match self {
            ProcedureKind::Query => "query",
            ProcedureKind::Mutation => "mutation",
            ProcedureKind::Subscription => "subscription",
        }
    }
}

/// Metadata about the call currently being executed. Handed to every
/// middleware in the chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub kind: ProcedureKind,
    pub path: Cow<'static, str>,
}

impl RequestContext {
    pub(crate) fn new(kind: ProcedureKind, path: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

pub type SubscriptionStream = Pin<Box<dyn Stream<Item = Result<Value, Error>> + Send>>;

/// What a procedure produced: a single value for queries/mutations, a lazy
/// stream of values for subscriptions. The stream has not been polled when it
/// is returned.
pub enum ProcedureResult {
    Value(Value),
    Stream(SubscriptionStream),
}

impl fmt::Debug for ProcedureResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureResult::Value(value) => write!(f, "ProcedureResult::Value({value:?})"),
            ProcedureResult::Stream(_) => write!(f, "ProcedureResult::Stream(_)"),
        }
    }
}

pub(crate) type BoxHandler<TCtx> = Box<
    dyn Fn(TCtx, Value, RequestContext) -> BoxFuture<'static, Result<ProcedureResult, Error>>
        + Send
        + Sync,
>;

/// A single registered procedure: its kind, the middleware captured at
/// registration time and the terminal handler.
pub struct Procedure<TCtx> {
    pub(crate) kind: ProcedureKind,
    pub(crate) middleware: Vec<Middleware<TCtx>>,
    pub(crate) handler: BoxHandler<TCtx>,
}

impl<TCtx> Procedure<TCtx>
where
    TCtx: Send + 'static,
{
    pub fn kind(&self) -> ProcedureKind {
        self.kind
    }

    /// Run the middleware chain and then the handler, exactly once each.
    ///
    /// Panics inside middleware or the handler are caught here so a broken
    /// procedure can never take down the transport that invoked it.
    pub async fn exec(
        &self,
        ctx: TCtx,
        input: Value,
        req: RequestContext,
    ) -> Result<ProcedureResult, ExecError> {
        let fut = crate::middleware::run_chain(&self.middleware, ctx, input, req, &self.handler);

        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result.map_err(ExecError::Resolver),
            Err(_panic) => Err(ExecError::ResolverPanic),
        }
    }
}
