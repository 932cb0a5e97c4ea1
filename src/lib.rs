//! # cavebridge
//!
//! An HTTP/1.1 transport that hands every routed request to a single
//! handler execution context and returns exactly one response.
//!
//! The transport side is multi-threaded: it accepts connections, parses
//! requests and looks up a numeric handler id in a shared route table. The
//! handler side runs on one dedicated thread, where handler logic may answer
//! immediately or with a value that settles later. The two meet in the
//! [`bridge`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cavebridge::{App, AppConfig, NormalizedResponse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cavebridge::AppError> {
//!     let app = App::new(AppConfig::default())?;
//!     app.route("GET", "/hello", |_ctx| async {
//!         NormalizedResponse::text(200, "Hello, World!")
//!     });
//!     let transport = app.start().await?;
//!     println!("Listening on http://{}", transport.local_addr());
//!     tokio::signal::ctrl_c().await.ok();
//!     transport.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod bridge;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod normalized;
pub mod resolve;
pub mod router;
pub mod security;
pub mod server;

pub use app::{App, AppError};
pub use bridge::{BridgeError, DispatchBridge};
pub use config::AppConfig;
pub use context::Context;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use normalized::{NormalizedRequest, NormalizedResponse};
pub use resolve::{Deferred, Outcome, Settle};
pub use router::{HandlerId, RouteRegistry};
pub use server::{Gateway, Server, ServerError, TransportHandle};
