use std::{borrow::Cow, collections::HashMap, future::Future, sync::Arc};

use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::{
    middleware, router::ProcedureMap, Error, ErrorCode, Middleware, Procedure, ProcedureKind,
    ProcedureResult, RequestContext, ResponseError, Router,
};

/// An error raised while building a [`Router`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error(
        "a procedure or router name must be more than 1 character and less than 255 characters"
    )]
    InvalidName,
    #[error("a procedure or router name contains the character '{0}' which is not allowed. Names must be alphanumeric or have '_' or '-'")]
    InvalidCharInName(char),
    #[error("a procedure or router name is using the name '{0}' which is reserved for internal use.")]
    ReservedName(String),
    #[error("a procedure with the name '{0}' has already been registered")]
    DuplicateName(String),
}

pub(crate) fn is_valid_name(name: &str) -> Option<BuildError> {
    if name.is_empty() || name.len() > 255 {
        return Some(BuildError::InvalidName);
    }

    for c in name.chars() {
        if !(c.is_alphanumeric() || c == '_' || c == '-' || c == '~' || c == '.') {
            return Some(BuildError::InvalidCharInName(c));
        }
    }

    if name == "arpc" || name == "_batch" || name == "ws" {
        return Some(BuildError::ReservedName(name.to_string()));
    }

    None
}

/// Builder for a [`Router`].
///
/// Middleware registered with [`RouterBuilder::middleware`] applies to every
/// procedure registered *after* it.
pub struct RouterBuilder<TCtx = ()>
where
    TCtx: Send + 'static,
{
    queries: ProcedureMap<TCtx>,
    mutations: ProcedureMap<TCtx>,
    subscriptions: ProcedureMap<TCtx>,
    middleware: Vec<Middleware<TCtx>>,
    error_formatter: Option<crate::router::ErrorFormatter>,
    error: Option<BuildError>,
}

impl<TCtx> Default for RouterBuilder<TCtx>
where
    TCtx: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<TCtx> RouterBuilder<TCtx>
where
    TCtx: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
            mutations: HashMap::new(),
            subscriptions: HashMap::new(),
            middleware: Vec::new(),
            error_formatter: None,
            error: None,
        }
    }

    /// Append a middleware to the chain captured by procedures registered
    /// from this point on.
    pub fn middleware<TFut, F>(mut self, func: F) -> Self
    where
        F: Fn(TCtx, RequestContext) -> TFut + Send + Sync + 'static,
        TFut: Future<Output = Result<TCtx, Error>> + Send + 'static,
    {
        self.middleware.push(middleware::from_fn(func));
        self
    }

    /// Set a pure transform applied to every error shape before it is
    /// serialized. Runs exactly once per error.
    pub fn error_formatter<F>(mut self, func: F) -> Self
    where
        F: Fn(ResponseError, &Error) -> ResponseError + Send + Sync + 'static,
    {
        self.error_formatter = Some(Arc::new(func));
        self
    }

    pub fn query<TArg, TOutput, TFut, F>(
        self,
        name: impl Into<Cow<'static, str>>,
        resolver: F,
    ) -> Self
    where
        F: Fn(TCtx, TArg) -> TFut + Send + Sync + 'static,
        TArg: DeserializeOwned + Send + 'static,
        TOutput: Serialize,
        TFut: Future<Output = Result<TOutput, Error>> + Send + 'static,
    {
        self.procedure(ProcedureKind::Query, name.into(), request_handler(resolver))
    }

    pub fn mutation<TArg, TOutput, TFut, F>(
        self,
        name: impl Into<Cow<'static, str>>,
        resolver: F,
    ) -> Self
    where
        F: Fn(TCtx, TArg) -> TFut + Send + Sync + 'static,
        TArg: DeserializeOwned + Send + 'static,
        TOutput: Serialize,
        TFut: Future<Output = Result<TOutput, Error>> + Send + 'static,
    {
        self.procedure(
            ProcedureKind::Mutation,
            name.into(),
            request_handler(resolver),
        )
    }

    pub fn subscription<TArg, TOutput, TStream, F>(
        self,
        name: impl Into<Cow<'static, str>>,
        resolver: F,
    ) -> Self
    where
        F: Fn(TCtx, TArg) -> TStream + Send + Sync + 'static,
        TArg: DeserializeOwned + Send + 'static,
        TOutput: Serialize,
        TStream: Stream<Item = Result<TOutput, Error>> + Send + 'static,
    {
        let handler: crate::procedure::BoxHandler<TCtx> = Box::new(move |ctx, input, _req| {
            let result = deserialize_arg(input).map(|arg| {
                let stream = resolver(ctx, arg).map(|item| item.and_then(serialize_output));
                ProcedureResult::Stream(Box::pin(stream))
            });
            Box::pin(std::future::ready(result))
        });

        self.procedure(ProcedureKind::Subscription, name.into(), handler)
    }

    fn procedure(
        mut self,
        kind: ProcedureKind,
        name: Cow<'static, str>,
        handler: crate::procedure::BoxHandler<TCtx>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }

        if let Some(err) = is_valid_name(&name) {
            self.error = Some(err);
            return self;
        }

        let map = match kind {
            ProcedureKind::Query => &mut self.queries,
            ProcedureKind::Mutation => &mut self.mutations,
            ProcedureKind::Subscription => &mut self.subscriptions,
        };

        if map.contains_key(&name) {
            self.error = Some(BuildError::DuplicateName(name.into_owned()));
            return self;
        }

        map.insert(
            name,
            Procedure {
                kind,
                middleware: self.middleware.clone(),
                handler,
            },
        );
        self
    }

    pub fn build(self) -> Result<Router<TCtx>, BuildError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        Ok(Router {
            queries: self.queries,
            mutations: self.mutations,
            subscriptions: self.subscriptions,
            error_formatter: self.error_formatter,
        })
    }
}

fn deserialize_arg<TArg: DeserializeOwned>(input: Value) -> Result<TArg, Error> {
    serde_json::from_value(input).map_err(|err| {
        Error::with_cause(
            ErrorCode::BadRequest,
            "error deserializing procedure arguments".into(),
            err,
        )
    })
}

fn serialize_output<TOutput: Serialize>(output: TOutput) -> Result<Value, Error> {
    serde_json::to_value(output).map_err(|err| {
        Error::with_cause(
            ErrorCode::InternalServerError,
            "error serializing procedure result".into(),
            err,
        )
    })
}

fn request_handler<TCtx, TArg, TOutput, TFut, F>(resolver: F) -> crate::procedure::BoxHandler<TCtx>
where
    TCtx: Send + 'static,
    F: Fn(TCtx, TArg) -> TFut + Send + Sync + 'static,
    TArg: DeserializeOwned + Send + 'static,
    TOutput: Serialize,
    TFut: Future<Output = Result<TOutput, Error>> + Send + 'static,
{
    Box::new(move |ctx, input, _req| {
        let result = deserialize_arg(input).map(|arg| resolver(ctx, arg));
        Box::pin(async move {
            let output = result?.await?;
            serialize_output(output).map(ProcedureResult::Value)
        })
    })
}
