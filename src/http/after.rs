//! Scheduling deferred work from request handlers.
//!
//! # Responsibilities
//! - Track each request as in flight while its handler runs
//! - Hold deferred tasks in Pending until the response is ready
//! - Give handlers an extractor to register work without knowing about shutdown

use std::convert::Infallible;
use std::future::Future;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tokio::sync::watch;

use crate::deferred::{DeferredRegistry, TaskHandle, TaskResult};
use crate::http::server::AppState;

/// Header carrying the request ID set by the request-id layer.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Per-request context installed by [`defer_after_response`].
#[derive(Debug, Clone)]
pub struct AfterContext {
    owner: String,
    response_ready: watch::Receiver<bool>,
}

impl AfterContext {
    fn gate(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut ready = self.response_ready.clone();
        async move {
            // A dropped sender means the handler is gone; run the task anyway.
            let _ = ready.wait_for(|ready| *ready).await;
        }
    }
}

/// Middleware: count the request as in flight and release its deferred tasks
/// once the handler has produced a response.
pub async fn defer_after_response(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let _in_flight = state.inflight.track();
    let owner = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let (ready_tx, response_ready) = watch::channel(false);
    request.extensions_mut().insert(AfterContext { owner, response_ready });

    let response = next.run(request).await;
    ready_tx.send_replace(true);
    response
}

/// Extractor for registering post-response work.
///
/// ```ignore
/// async fn handler(after: After) -> &'static str {
///     after.run("audit-log", || async {
///         write_audit_log().await?;
///         Ok(())
///     });
///     "ok"
/// }
/// ```
pub struct After {
    registry: DeferredRegistry,
    context: Option<AfterContext>,
}

impl After {
    /// Schedule `action` to run after the response.
    ///
    /// Without the middleware in place the task may start immediately.
    pub fn run<F, Fut>(&self, label: impl Into<String>, action: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        match &self.context {
            Some(context) => self
                .registry
                .register_after(context.owner.clone(), label, context.gate(), action),
            None => self.registry.register("-", label, action),
        }
    }

    /// Request ID that owns tasks registered through this extractor.
    pub fn owner(&self) -> &str {
        self.context.as_ref().map(|c| c.owner.as_str()).unwrap_or("-")
    }
}

impl<S> FromRequestParts<S> for After
where
    S: Send + Sync,
    DeferredRegistry: FromRef<S>,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self {
            registry: DeferredRegistry::from_ref(state),
            context: parts.extensions.get::<AfterContext>().cloned(),
        })
    }
}
