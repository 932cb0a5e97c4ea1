//! Application layer: typed handlers, middleware and mounting on top of the
//! route registry and dispatch bridge.
//!
//! ```rust,no_run
//! use cavebridge::app::App;
//! use cavebridge::config::AppConfig;
//! use cavebridge::normalized::NormalizedResponse;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cavebridge::app::AppError> {
//!     let mut app = App::new(AppConfig::default())?;
//!     app.mount("/api");
//!     app.route("get", "users", |_ctx| async { NormalizedResponse::text(200, "[]") });
//!
//!     let transport = app.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     transport.stop().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, DispatchBridge};
use crate::config::{AppConfig, ConfigError};
use crate::context::Context;
use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::normalized::{NormalizedRequest, NormalizedResponse};
use crate::resolve::{Deferred, Outcome};
use crate::router::{HandlerId, RouteRegistry};
use crate::server::{self, Gateway, Server, ServerError, TransportHandle};

const HEALTH_BODY: &str = r#"{"ok":true}"#;

/// The future a [`Handler`] returns. Polled on the handler context only.
pub type HandlerFuture = LocalBoxFuture<'static, NormalizedResponse>;

/// Type-erased async handler from [`Context`] to [`NormalizedResponse`].
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = NormalizedResponse>` that is
/// `Send + Sync + 'static` qualifies. The future itself may hold `!Send`
/// state.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = NormalizedResponse> + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

struct Endpoint {
    handler: Handler,
    // health routes skip the middleware chain
    bare: bool,
}

// Everything the dispatcher closure reads on the handler context.
struct Shared {
    endpoints: RwLock<HashMap<HandlerId, Endpoint>>,
    chain: RwLock<Arc<[MiddlewareHandler]>>,
}

impl Shared {
    fn dispatch(&self, id: HandlerId, request: NormalizedRequest) -> Outcome {
        let (handler, bare) = match self.endpoints.read().get(&id) {
            Some(endpoint) => (Arc::clone(&endpoint.handler), endpoint.bare),
            None => {
                warn!(handler = %id, "dispatched id has no handler");
                return into_value(NormalizedResponse::not_found()).into();
            }
        };
        let chain: Arc<[MiddlewareHandler]> = if bare {
            Arc::from(Vec::new())
        } else {
            Arc::clone(&*self.chain.read())
        };

        Deferred::from_future(async move {
            let response = Next::new(chain, handler).run(Context::new(request)).await;
            serde_json::to_value(response).map_err(|e| Value::String(e.to_string()))
        })
        .into()
    }
}

fn into_value(response: NormalizedResponse) -> Value {
    serde_json::to_value(response).unwrap_or(Value::Null)
}

/// Routes, middleware and the handler table for one server.
pub struct App {
    config: AppConfig,
    registry: Arc<RouteRegistry>,
    bridge: DispatchBridge,
    shared: Arc<Shared>,
    base_path: String,
}

impl App {
    /// Starts the handler execution context for a new, empty application.
    ///
    /// # Errors
    ///
    /// [`AppError::Bridge`] if the handler context cannot be started.
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let bridge = DispatchBridge::spawn(config.handler_timeout())?;
        Ok(Self {
            config,
            registry: Arc::new(RouteRegistry::new()),
            bridge,
            shared: Arc::new(Shared {
                endpoints: RwLock::new(HashMap::new()),
                chain: RwLock::new(Arc::from(Vec::new())),
            }),
            base_path: String::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Registers `handler` for `method` and `path` under the current mount.
    ///
    /// The method is matched case-insensitively by uppercasing it here.
    /// Registering the same pair again shadows the earlier handler.
    pub fn route(&self, method: &str, path: &str, handler: impl IntoHandler) -> HandlerId {
        self.register(method, self.full_path(path), handler, false)
    }

    /// Prefixes `base` to routes registered from now on.
    ///
    /// `mount("/api")` followed by `route("GET", "users", …)` serves
    /// `/api/users`. An empty base path clears the mount.
    pub fn mount(&mut self, base: &str) {
        self.base_path = base.trim_end_matches('/').to_owned();
        debug!(base = %self.base_path, "mount base set");
    }

    /// Appends `middleware` to the chain run before every handler.
    pub fn use_middleware<M>(&self, middleware: M)
    where
        M: Middleware + 'static,
    {
        let mut chain = self.shared.chain.write();
        let mut next = chain.to_vec();
        next.push(from_middleware(Arc::new(middleware)));
        *chain = next.into();
    }

    /// Answers `GET path` with `200 {"ok":true}`.
    ///
    /// The path is taken from the server root and the route skips the
    /// middleware chain, so probes need no credentials.
    pub fn health_check(&self, path: &str) -> HandlerId {
        let path = format!("/{}", path.trim_start_matches('/'));
        let health = |_ctx: Context| async {
            NormalizedResponse::text(200, HEALTH_BODY).with_header("content-type", "application/json")
        };
        self.register("GET", path, health, true)
    }

    /// The transport-side view of this application.
    pub fn gateway(&self) -> Gateway {
        Gateway::new(Arc::clone(&self.registry), self.bridge.clone())
    }

    /// Registers the configured health route and starts listening.
    ///
    /// With `health_interval_ms` set, the listener also requests its own
    /// health route on that period.
    ///
    /// # Errors
    ///
    /// [`AppError::Server`] if the configured address cannot be bound.
    pub async fn start(&self) -> Result<TransportHandle, AppError> {
        let health_path = self.config.health_path.clone();
        self.health_check(&health_path);

        let server = Server::bind(self.config.bind_addr())
            .await?
            .max_request_bytes(self.config.max_request_bytes);
        info!(addr = %server.local_addr(), routes = self.registry.len(), "listening");
        let transport = server::spawn(server, self.gateway());
        Ok(match self.config.health_interval() {
            Some(every) => transport.with_health_probe(health_path, every),
            None => transport,
        })
    }

    fn register(
        &self,
        method: &str,
        path: String,
        handler: impl IntoHandler,
        bare: bool,
    ) -> HandlerId {
        self.ensure_dispatcher();

        let method = method.to_ascii_uppercase();
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));

        // A request that resolves the new id must find its handler: the
        // table stays locked until both are in place.
        let mut endpoints = self.shared.endpoints.write();
        let id = self.registry.register(&method, &path);
        endpoints.insert(id, Endpoint { handler, bare });
        drop(endpoints);

        info!(%method, %path, handler = %id, "route registered");
        id
    }

    fn ensure_dispatcher(&self) {
        if self.bridge.has_dispatcher() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.bridge
            .set_dispatcher(move |id, request| shared.dispatch(id, request));
    }

    fn full_path(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_path, path)
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("base_path", &self.base_path)
            .field("routes", &self.registry.len())
            .field("middleware", &self.shared.chain.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{ApiKey, RequireApiKey};
    use std::rc::Rc;

    fn app() -> App {
        App::new(AppConfig::default()).unwrap()
    }

    async fn call(app: &App, method: &str, url: &str) -> NormalizedResponse {
        app.gateway().respond(NormalizedRequest::new(method, url)).await
    }

    #[tokio::test]
    async fn method_is_case_insensitive_at_registration() {
        let app = app();
        app.route("post", "/events", |_ctx| async { NormalizedResponse::text(202, "") });
        assert_eq!(call(&app, "POST", "/events").await.status, 202);
        assert_eq!(app.registry().resolve("post", "/events"), None);
    }

    #[tokio::test]
    async fn mount_prefixes_later_routes() {
        let mut app = app();
        app.route("GET", "/root", |_ctx| async { NormalizedResponse::text(200, "root") });
        app.mount("/api/");
        app.route("GET", "users", |_ctx| async { NormalizedResponse::text(200, "users") });
        app.route("GET", "/items", |_ctx| async { NormalizedResponse::text(200, "items") });

        assert_eq!(call(&app, "GET", "/root").await.body, "root");
        assert_eq!(call(&app, "GET", "/api/users").await.body, "users");
        assert_eq!(call(&app, "GET", "/api/items").await.body, "items");
        assert_eq!(call(&app, "GET", "/users").await.status, 404);
    }

    #[tokio::test]
    async fn health_check_answers_ok() {
        let mut app = app();
        app.use_middleware(RequireApiKey);
        app.mount("/api");
        app.health_check("healthz");
        let res = call(&app, "GET", "/healthz").await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body, HEALTH_BODY);
        assert_eq!(res.headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn handler_sees_query_and_body() {
        let app = app();
        app.route("POST", "/echo", |ctx: Context| async move {
            let req = ctx.request();
            let body = format!("{}:{}", req.query_param("tag").unwrap_or(""), req.body().unwrap_or(""));
            NormalizedResponse::text(200, body)
        });
        let req = NormalizedRequest::new("POST", "/echo?tag=a").body_text("payload");
        assert_eq!(app.gateway().respond(req).await.body, "a:payload");
    }

    #[tokio::test]
    async fn middleware_runs_before_handler() {
        let app = app();
        app.use_middleware(RequireApiKey);
        app.route("GET", "/me", |ctx: Context| async move {
            let key = ctx.extensions().get::<ApiKey>().map(|k| k.0.clone()).unwrap_or_default();
            NormalizedResponse::text(200, key)
        });

        assert_eq!(call(&app, "GET", "/me").await.status, 401);
        let req = NormalizedRequest::new("GET", "/me").header("x-api-key", "secret");
        assert_eq!(app.gateway().respond(req).await.body, "secret");
    }

    #[tokio::test]
    async fn handler_future_need_not_be_send() {
        let app = app();
        app.route("GET", "/local", |_ctx| async {
            let local = Rc::new("local");
            tokio::task::yield_now().await;
            NormalizedResponse::text(200, *local)
        });
        assert_eq!(call(&app, "GET", "/local").await.body, "local");
    }

    #[tokio::test]
    async fn panicking_handler_is_handler_failure() {
        let app = app();
        app.route("GET", "/boom", |_ctx| async {
            if true {
                panic!("handler bug");
            }
            NormalizedResponse::default()
        });
        assert_eq!(call(&app, "GET", "/boom").await, NormalizedResponse::handler_failure());
    }

    #[tokio::test]
    async fn id_without_handler_is_not_found() {
        let app = app();
        app.route("GET", "/known", |_ctx| async { NormalizedResponse::default() });
        // registered behind the app's back, so the table has no entry
        let stray = app.registry().register("GET", "/stray");
        let res = app
            .bridge
            .invoke(stray, NormalizedRequest::new("GET", "/stray"))
            .await
            .unwrap();
        assert_eq!(res, NormalizedResponse::not_found());
    }

    #[test]
    fn route_is_not_resolvable_before_its_handler_is_stored() {
        let app = app();
        std::thread::scope(|scope| {
            let table = app.shared.endpoints.read();
            let registering = scope.spawn(|| {
                app.route("GET", "/late", |_ctx| async {
                    NormalizedResponse::text(200, "late")
                })
            });

            // the registering thread is blocked on the table
            for _ in 0..20 {
                assert_eq!(app.registry().resolve("GET", "/late"), None);
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            drop(table);

            let id = registering.join().unwrap();
            assert_eq!(app.registry().resolve("GET", "/late"), Some(id));
            assert!(app.shared.endpoints.read().contains_key(&id));
        });
    }

    #[tokio::test]
    async fn start_serves_configured_health_path() {
        let config = AppConfig::from_toml_str("port = 0\nhealth_path = \"ready\"").unwrap();
        let app = App::new(config).unwrap();
        let transport = app.start().await.unwrap();
        assert!(app.registry().resolve("GET", "/ready").is_some());
        assert_ne!(transport.local_addr().port(), 0);
        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_with_health_interval_stops_cleanly() {
        let config = AppConfig::from_toml_str("port = 0\nhealth_interval_ms = 10").unwrap();
        let app = App::new(config).unwrap();
        let transport = app.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        transport.stop().await.unwrap();
    }
}
