use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bridge::{BridgeError, DispatchBridge};
use crate::http::{Request, Response};
use crate::normalized::{NormalizedRequest, NormalizedResponse};
use crate::router::RouteRegistry;

const INTERNAL_ERROR_BODY: &str = r#"{"error":"Internal server error"}"#;
const UNAVAILABLE_BODY: &str = r#"{"error":"Service unavailable"}"#;

/// The transport's side of the bridge: route, invoke, render.
///
/// A routing miss is answered here with `404` and never reaches the bridge.
/// Bridge errors are logged by kind and mapped to a status:
///
/// | Error                          | Status |
/// |--------------------------------|--------|
/// | `NoDispatcher`, `Spawn`        | 500    |
/// | `Conversion`                   | 500 (handler-failure body) |
/// | `ContextClosed`                | 503    |
#[derive(Clone, Debug)]
pub struct Gateway {
    registry: Arc<RouteRegistry>,
    bridge: DispatchBridge,
}

impl Gateway {
    pub fn new(registry: Arc<RouteRegistry>, bridge: DispatchBridge) -> Self {
        Self { registry, bridge }
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    pub fn bridge(&self) -> &DispatchBridge {
        &self.bridge
    }

    /// Answers one wire request.
    pub async fn handle(&self, request: Request) -> Response {
        self.respond(NormalizedRequest::from_wire(&request))
            .await
            .into_wire()
    }

    /// Answers one normalized request.
    pub async fn respond(&self, request: NormalizedRequest) -> NormalizedResponse {
        let Some(handler) = self.registry.resolve(request.method(), request.path()) else {
            debug!(method = %request.method(), path = %request.path(), "no route");
            return NormalizedResponse::not_found();
        };

        match self.bridge.invoke(handler, request).await {
            Ok(response) => response,
            Err(BridgeError::Conversion(e)) => {
                error!(%handler, error = %e, "handler returned a value that is not a response");
                NormalizedResponse::handler_failure()
            }
            Err(BridgeError::ContextClosed) => {
                warn!(%handler, "handler execution context is gone");
                NormalizedResponse::text(503, UNAVAILABLE_BODY)
            }
            Err(e) => {
                error!(%handler, error = %e, "request could not be dispatched; check bridge wiring");
                NormalizedResponse::text(500, INTERNAL_ERROR_BODY)
            }
        }
    }
}
