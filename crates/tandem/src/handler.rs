//! Method handlers and the adapters that build them from plain functions.
//!
//! A handler receives the per-request [`ServerContext`] and the parsed
//! [`Request`] and produces a JSON result or an [`RpcError`]. The [`method`]
//! adapter wraps a typed async function, decoding params and encoding the
//! result through serde; [`handler_fn`] wraps an untyped function that wants
//! the raw request.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use tandem_wire::{Request, RpcError};

use crate::server::ServerContext;

/// An invocable method.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: ServerContext, req: Request) -> Result<Value, RpcError>;
}

/// A shared, dynamically-dispatched handler, as stored in assigners.
pub type BoxHandler = Arc<dyn Handler>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(ServerContext, Request) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync,
{
    async fn handle(&self, ctx: ServerContext, req: Request) -> Result<Value, RpcError> {
        (self.f)(ctx, req).await
    }
}

/// Wrap an async function over the raw request into a handler.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(ServerContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |ctx: ServerContext, req: Request| f(ctx, req).boxed(),
    })
}

/// Wrap a typed async function into a handler.
///
/// Params are decoded with serde (absent params decode from JSON `null`, so
/// `Option<T>` works for parameterless calls); a decode failure answers
/// `InvalidParams`. The result is encoded with serde.
pub fn method<P, R, F, Fut>(f: F) -> BoxHandler
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize,
    F: Fn(ServerContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(FnHandler {
        f: move |ctx: ServerContext, req: Request| {
            let f = Arc::clone(&f);
            async move {
                let params: P = req.decode_params()?;
                let result = f(ctx, params).await?;
                serde_json::to_value(result)
                    .map_err(|e| RpcError::internal_error(e.to_string()))
            }
            .boxed()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerContext;
    use serde_json::json;

    fn ctx() -> ServerContext {
        ServerContext::detached()
    }

    #[tokio::test]
    async fn typed_method_decodes_and_encodes() {
        let add = method(|_ctx, values: Vec<i64>| async move {
            Ok::<_, RpcError>(values.iter().sum::<i64>())
        });
        let req = Request::call(1, "Add", Some(json!([1, 2, 3])));
        let result = add.handle(ctx(), req).await.unwrap();
        assert_eq!(result, json!(6));
    }

    #[tokio::test]
    async fn typed_method_rejects_bad_params() {
        let add = method(|_ctx, values: Vec<i64>| async move {
            Ok::<_, RpcError>(values.iter().sum::<i64>())
        });
        let req = Request::call(1, "Add", Some(json!({"x": 1})));
        let err = add.handle(ctx(), req).await.unwrap_err();
        assert_eq!(err.code, tandem_wire::error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn typed_method_with_optional_params() {
        let status = method(|_ctx, _params: Option<Value>| async { Ok::<_, RpcError>("ok") });
        let req = Request::call(1, "Status", None);
        let result = status.handle(ctx(), req).await.unwrap();
        assert_eq!(result, json!("ok"));
    }

    #[tokio::test]
    async fn raw_handler_sees_the_request() {
        let echo = handler_fn(|_ctx, req: Request| async move {
            Ok(json!({"method": req.method, "notification": req.is_notification()}))
        });
        let req = Request::notification("Alert", None);
        let result = echo.handle(ctx(), req).await.unwrap();
        assert_eq!(result, json!({"method": "Alert", "notification": true}));
    }
}
