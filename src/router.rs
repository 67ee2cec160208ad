use std::{borrow::Cow, collections::HashMap, sync::Arc};

use serde_json::Value;

use crate::{
    Error, ExecError, Procedure, ProcedureKind, ProcedureResult, RequestContext, ResponseError,
    RouterBuilder,
};

pub(crate) type ProcedureMap<TCtx> = HashMap<Cow<'static, str>, Procedure<TCtx>>;

pub(crate) type ErrorFormatter =
    Arc<dyn Fn(ResponseError, &Error) -> ResponseError + Send + Sync>;

/// A built procedure registry: one flat string-keyed map per procedure kind.
///
/// Splitting the maps by kind means a request for a `query` can never resolve
/// to a `mutation` of the same name; a kind mismatch is a `NotFound`.
pub struct Router<TCtx = ()>
where
    TCtx: Send + 'static,
{
    pub(crate) queries: ProcedureMap<TCtx>,
    pub(crate) mutations: ProcedureMap<TCtx>,
    pub(crate) subscriptions: ProcedureMap<TCtx>,
    pub(crate) error_formatter: Option<ErrorFormatter>,
}

impl<TCtx> Router<TCtx>
where
    TCtx: Send + 'static,
{
    pub fn builder() -> RouterBuilder<TCtx> {
        RouterBuilder::new()
    }

    pub fn arced(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn queries(&self) -> &HashMap<Cow<'static, str>, Procedure<TCtx>> {
        &self.queries
    }

    pub fn mutations(&self) -> &HashMap<Cow<'static, str>, Procedure<TCtx>> {
        &self.mutations
    }

    pub fn subscriptions(&self) -> &HashMap<Cow<'static, str>, Procedure<TCtx>> {
        &self.subscriptions
    }

    fn procedures(&self, kind: ProcedureKind) -> &ProcedureMap<TCtx> {
        match kind {
            ProcedureKind::Query => &self.queries,
            ProcedureKind::Mutation => &self.mutations,
            ProcedureKind::Subscription => &self.subscriptions,
        }
    }

    /// Resolve `path` against the registry and execute the matching
    /// procedure. Queries and mutations resolve to a single value,
    /// subscriptions to a lazy stream.
    pub async fn execute(
        &self,
        ctx: TCtx,
        kind: ProcedureKind,
        path: &str,
        input: Option<Value>,
    ) -> Result<ProcedureResult, ExecError> {
        let procedure = self
            .procedures(kind)
            .get(path)
            .ok_or(ExecError::OperationNotFound)?;

        #[cfg(feature = "tracing")]
        tracing::trace!("executing {} '{}'", kind.to_str(), path);

        procedure
            .exec(
                ctx,
                input.unwrap_or(Value::Null),
                RequestContext::new(kind, path.to_string()),
            )
            .await
    }

    /// Convert an internal error into its wire shape, applying the
    /// user-supplied error formatter exactly once.
    pub fn format_error(&self, err: ExecError) -> ResponseError {
        let err = Error::from(err);
        let shape = ResponseError::from(err.clone());

        match &self.error_formatter {
            Some(formatter) => formatter(shape, &err),
            None => shape,
        }
    }
}
