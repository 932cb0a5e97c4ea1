//! Middleware pipeline: composable before/after logic around a handler.
//!
//! Each middleware wraps the rest of the chain and may:
//!
//! - **Pass through**: call `next.run(ctx).await` unchanged.
//! - **Short-circuit**: return a [`NormalizedResponse`] without calling `next`.
//! - **Decorate**: call `next.run(ctx).await` and adjust what comes back.
//!
//! The chain ends in the route's handler. Everything here runs on the
//! handler execution context, so the futures are not required to be `Send`.

use std::sync::Arc;

use futures::future::LocalBoxFuture;
use tokio::time::Instant;

use crate::app::{Handler, HandlerFuture};
use crate::context::Context;
use crate::normalized::NormalizedResponse;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> HandlerFuture + Send + Sync + 'static>;

/// Cursor into the remaining chain for one request.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// request at most once.
pub struct Next {
    chain: Arc<[MiddlewareHandler]>,
    index: usize,
    endpoint: Handler,
}

impl Next {
    /// Starts a cursor at the head of `chain`, ending in `endpoint`.
    pub fn new(chain: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            chain,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    pub async fn run(mut self, ctx: Context) -> NormalizedResponse {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                self.index += 1;
                middleware(ctx, self).await
            }
            None => (self.endpoint)(ctx).await,
        }
    }
}

/// The trait implemented by middleware structs.
///
/// Implementations must be `Send + Sync` because one instance serves every
/// request; the futures they return stay on the handler context.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> LocalBoxFuture<'static, NormalizedResponse>;
}

/// Converts a [`Middleware`] into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Logs method, path, status, and duration of every request.
///
/// Emits one `tracing::info!` record after the downstream handler completes:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> LocalBoxFuture<'static, NormalizedResponse> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().to_owned();
            let path = ctx.request().path().to_owned();

            let response = next.run(ctx).await;

            tracing::info!(
                "{} {} - {} ({:?})",
                method,
                path,
                response.status,
                start.elapsed()
            );
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalized::NormalizedRequest;
    use parking_lot::Mutex;

    fn endpoint(body: &'static str) -> Handler {
        Arc::new(move |_ctx: Context| -> HandlerFuture {
            Box::pin(async move { NormalizedResponse::text(200, body) })
        })
    }

    fn ctx() -> Context {
        Context::new(NormalizedRequest::new("GET", "/"))
    }

    fn recorder(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> MiddlewareHandler {
        Arc::new(move |ctx: Context, next: Next| -> HandlerFuture {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(name);
                let res = next.run(ctx).await;
                log.lock().push(name);
                res
            })
        })
    }

    #[tokio::test]
    async fn empty_chain_runs_endpoint() {
        let next = Next::new(Arc::from(Vec::new()), endpoint("done"));
        assert_eq!(next.run(ctx()).await.body, "done");
    }

    #[tokio::test]
    async fn middleware_wraps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Arc<[MiddlewareHandler]> = Arc::from(vec![
            recorder(Arc::clone(&log), "outer"),
            recorder(Arc::clone(&log), "inner"),
        ]);
        let res = Next::new(chain, endpoint("ok")).run(ctx()).await;
        assert_eq!(res.body, "ok");
        assert_eq!(*log.lock(), vec!["outer", "inner", "inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let stop: MiddlewareHandler = Arc::new(|_ctx: Context, _next: Next| -> HandlerFuture {
            Box::pin(async { NormalizedResponse::text(401, "no") })
        });
        let res = Next::new(Arc::from(vec![stop]), endpoint("unreachable"))
            .run(ctx())
            .await;
        assert_eq!(res.status, 401);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let chain: Arc<[MiddlewareHandler]> =
            Arc::from(vec![from_middleware(Arc::new(LoggerMiddleware))]);
        let res = Next::new(chain, endpoint("logged")).run(ctx()).await;
        assert_eq!(res, NormalizedResponse::text(200, "logged"));
    }
}
