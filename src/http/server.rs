//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the demo handlers
//! - Wire up middleware (request ID, tracing, timeout, deferred-work release)
//! - Serve until the stop-accepting broadcast fires

use std::time::Duration;

use axum::{
    extract::{FromRef, Query, State},
    middleware,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::{AppConfig, ServerConfig};
use crate::deferred::DeferredRegistry;
use crate::http::after::{defer_after_response, After};
use crate::http::inflight::InFlightRequests;
use crate::lifecycle::mode::RuntimeMode;
use crate::lifecycle::shutdown::{CoordinatorState, Shutdown};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: DeferredRegistry,
    pub inflight: InFlightRequests,
    pub coordinator: watch::Receiver<CoordinatorState>,
    pub mode: RuntimeMode,
    pub app: AppConfig,
}

impl FromRef<AppState> for DeferredRegistry {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}

/// HTTP server.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        let router = Self::build_router(&config, state);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        Router::new()
            .route("/", get(page_handler))
            .route("/status", get(status_handler))
            .layer(middleware::from_fn_with_state(state.clone(), defer_after_response))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Serve on `listener` until `shutdown` is triggered.
    ///
    /// Axum stops accepting as soon as the broadcast fires and then lets open
    /// connections finish their in-flight requests.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                shutdown.signalled().await;
                tracing::info!("HTTP server no longer accepting connections");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    sleep_ms: Option<u64>,
}

/// Index page. Schedules a sleep that runs after the response is sent.
async fn page_handler(State(state): State<AppState>, Query(query): Query<PageQuery>, after: After) -> &'static str {
    let sleep = Duration::from_millis(query.sleep_ms.unwrap_or(state.app.after_sleep_ms));

    after.run("page-after", move || async move {
        tracing::info!("[after] starting sleep");
        tokio::time::sleep(sleep).await;
        tracing::info!("[after] finished sleep");
        Ok(())
    });

    "Hello"
}

#[derive(Debug, Serialize)]
struct StatusBody {
    state: CoordinatorState,
    mode: RuntimeMode,
    outstanding_tasks: usize,
    in_flight_requests: usize,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        state: *state.coordinator.borrow(),
        mode: state.mode,
        outstanding_tasks: state.registry.outstanding_count(),
        in_flight_requests: state.inflight.active_count(),
    })
}
