//! Dispatch bridge: carry a request from any transport worker onto the
//! single handler execution context and carry exactly one response back.
//!
//! ```text
//!  transport task ──(HandlerId, NormalizedRequest, reply)──▶ job queue
//!                                                             │
//!                                        handler context thread (LocalSet)
//!                                                             │
//!                                  dispatcher(id, request) ─▶ Outcome
//!                                                             │
//!                                                  resolve::resolve
//!                                                             │
//!  transport task ◀──────────── Result<NormalizedResponse, BridgeError>
//! ```
//!
//! Every job runs as its own local task, so a handler that is still waiting
//! on a deferred value never holds up the next request. Handler futures stay
//! on one thread and need not be `Send`.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::normalized::{NormalizedRequest, NormalizedResponse};
use crate::resolve::{self, ConversionError, Outcome};
use crate::router::HandlerId;

/// Name of the OS thread that runs handler logic.
pub const CONTEXT_THREAD_NAME: &str = "cavebridge-handlers";

/// Errors surfaced to the caller of [`DispatchBridge::invoke`].
///
/// Handler failures are not among them: a rejected or panicking handler is
/// answered with [`NormalizedResponse::handler_failure`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// `invoke` ran before any dispatcher was installed. A wiring bug.
    #[error("no dispatcher installed")]
    NoDispatcher,

    #[error("handler returned an unusable response: {0}")]
    Conversion(#[from] ConversionError),

    #[error("handler execution context is not running")]
    ContextClosed,

    #[error("failed to start handler execution context: {0}")]
    Spawn(#[source] io::Error),
}

type DispatchFn = dyn Fn(HandlerId, NormalizedRequest) -> Outcome + Send + Sync;

// ArcSwap needs a sized payload.
struct Dispatcher {
    call: Box<DispatchFn>,
}

struct Shared {
    dispatcher: ArcSwapOption<Dispatcher>,
    handler_timeout: Option<Duration>,
}

struct Job {
    handler: HandlerId,
    request: NormalizedRequest,
    reply: oneshot::Sender<Result<NormalizedResponse, BridgeError>>,
}

/// Handle to the handler execution context.
///
/// Cheap to clone; all clones share one dispatcher slot and one context
/// thread. The thread stops once every clone is dropped.
///
/// # Examples
///
/// ```
/// use cavebridge::bridge::DispatchBridge;
/// use cavebridge::normalized::NormalizedRequest;
/// use cavebridge::router::RouteRegistry;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), cavebridge::bridge::BridgeError> {
/// let registry = RouteRegistry::new();
/// let health = registry.register("GET", "/health");
///
/// let bridge = DispatchBridge::spawn(None)?;
/// bridge.set_dispatcher(|_id, _req| json!({ "status": 200, "body": "ok" }).into());
///
/// let res = bridge.invoke(health, NormalizedRequest::new("GET", "/health")).await?;
/// assert_eq!(res.status, 200);
/// assert_eq!(res.body, "ok");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DispatchBridge {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl DispatchBridge {
    /// Starts the handler execution context.
    ///
    /// With `handler_timeout` set, a handler that has not produced a response
    /// in time is answered with [`NormalizedResponse::handler_timeout`] and
    /// its late result is discarded.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Spawn`] if the runtime or thread cannot be created.
    pub fn spawn(handler_timeout: Option<Duration>) -> Result<Self, BridgeError> {
        let shared = Arc::new(Shared {
            dispatcher: ArcSwapOption::empty(),
            handler_timeout,
        });
        let (jobs, queue) = mpsc::unbounded_channel();
        start_context(Arc::clone(&shared), queue).map_err(BridgeError::Spawn)?;
        Ok(Self { shared, jobs })
    }

    /// Installs the dispatcher, replacing any previous one.
    ///
    /// The swap is atomic: a job observes either the old or the new
    /// dispatcher in full.
    pub fn set_dispatcher<F>(&self, dispatcher: F)
    where
        F: Fn(HandlerId, NormalizedRequest) -> Outcome + Send + Sync + 'static,
    {
        let previous = self.shared.dispatcher.swap(Some(Arc::new(Dispatcher {
            call: Box::new(dispatcher),
        })));
        info!(replaced = previous.is_some(), "dispatcher installed");
    }

    pub fn has_dispatcher(&self) -> bool {
        self.shared.dispatcher.load().is_some()
    }

    /// Runs handler logic for `handler` on the handler context and waits for
    /// its response without blocking the calling thread.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NoDispatcher`]: nothing is installed.
    /// - [`BridgeError::Conversion`]: the handler's value is not a response object.
    /// - [`BridgeError::ContextClosed`]: the context thread is gone.
    pub async fn invoke(
        &self,
        handler: HandlerId,
        request: NormalizedRequest,
    ) -> Result<NormalizedResponse, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job {
                handler,
                request,
                reply,
            })
            .map_err(|_| BridgeError::ContextClosed)?;
        response.await.map_err(|_| BridgeError::ContextClosed)?
    }
}

impl fmt::Debug for DispatchBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchBridge")
            .field("has_dispatcher", &self.has_dispatcher())
            .field("handler_timeout", &self.shared.handler_timeout)
            .finish()
    }
}

fn start_context(shared: Arc<Shared>, mut queue: mpsc::UnboundedReceiver<Job>) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    thread::Builder::new()
        .name(CONTEXT_THREAD_NAME.to_owned())
        .spawn(move || {
            let local = LocalSet::new();
            local.block_on(&runtime, async move {
                while let Some(job) = queue.recv().await {
                    tokio::task::spawn_local(run_job(Arc::clone(&shared), job));
                }
                debug!("job queue closed, handler context stopping");
            });
        })?;
    Ok(())
}

async fn run_job(shared: Arc<Shared>, job: Job) {
    let Job {
        handler,
        request,
        reply,
    } = job;
    let result = execute(&shared, handler, request).await;
    if reply.send(result).is_err() {
        debug!(%handler, "caller stopped waiting before the response was ready");
    }
}

async fn execute(
    shared: &Shared,
    handler: HandlerId,
    request: NormalizedRequest,
) -> Result<NormalizedResponse, BridgeError> {
    let dispatcher = shared
        .dispatcher
        .load_full()
        .ok_or(BridgeError::NoDispatcher)?;

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (dispatcher.call)(handler, request))) {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(%handler, "handler panicked while dispatching");
            return Ok(NormalizedResponse::handler_failure());
        }
    };

    let resolution = AssertUnwindSafe(resolve::resolve(outcome)).catch_unwind();
    let settled = match shared.handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, resolution).await {
            Ok(settled) => settled,
            Err(_) => {
                warn!(%handler, ?limit, "handler timed out");
                return Ok(NormalizedResponse::handler_timeout());
            }
        },
        None => resolution.await,
    };

    match settled {
        Ok(converted) => converted.map_err(BridgeError::from),
        Err(_) => {
            warn!(%handler, "deferred handler result panicked");
            Ok(NormalizedResponse::handler_failure())
        }
    }
}
