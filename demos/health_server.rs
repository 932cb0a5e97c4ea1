//! Health endpoint plus a small JSON API behind an API key.
//!
//! Run with:
//!   RUST_LOG=cavebridge=debug cargo run --example health_server [config.toml]
//!
//! Try:
//!   curl http://127.0.0.1:8080/health
//!   curl -X POST http://127.0.0.1:8080/api/events \
//!        -H 'x-api-key: dev' \
//!        -d '{"event":"start","data":{"n":1}}'
//!   curl -X POST http://127.0.0.1:8080/api/events -d '{}'   # 401

use std::time::Duration;

use cavebridge::app::App;
use cavebridge::config::AppConfig;
use cavebridge::context::Context;
use cavebridge::middleware::LoggerMiddleware;
use cavebridge::normalized::NormalizedResponse;
use cavebridge::security::RequireApiKey;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Deserialize)]
struct Event {
    event: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let mut app = App::new(config)?;
    app.use_middleware(LoggerMiddleware);
    app.use_middleware(RequireApiKey);

    app.mount("/api");
    app.route("post", "events", handle_event);

    let transport = app.start().await?;
    tracing::info!(addr = %transport.local_addr(), "ready");

    tokio::signal::ctrl_c().await?;
    transport.stop().await?;
    Ok(())
}

// POST /api/events
async fn handle_event(ctx: Context) -> NormalizedResponse {
    let event = match ctx.json::<Event>() {
        Ok(event) => event,
        Err(e) => return bad_request(&e.to_string()),
    };
    let Some(name) = event.event else {
        return bad_request("Event is required");
    };

    // stand-in for work that completes later
    tokio::time::sleep(Duration::from_millis(10)).await;

    NormalizedResponse::json(200, &json!({ "success": true, "event": name, "result": event.data }))
        .unwrap_or_else(|_| NormalizedResponse::handler_failure())
}

fn bad_request(message: &str) -> NormalizedResponse {
    NormalizedResponse::json(400, &json!({ "error": message }))
        .unwrap_or_else(|_| NormalizedResponse::handler_failure())
}
