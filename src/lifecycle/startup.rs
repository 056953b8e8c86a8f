//! Startup orchestration.
//!
//! # Responsibilities
//! - Derive the shutdown policy from the runtime mode
//! - Build the registry, in-flight tracker and coordinator
//! - Bind the listener and start serving
//!
//! # Design Decisions
//! - Fail fast: bind and signal-installation errors are fatal
//! - OS signal handlers are installed separately so tests can drive
//!   the coordinator through [`SignalIntercept::deliver`]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::deferred::DeferredRegistry;
use crate::http::{AppState, HttpServer, InFlightRequests};
use crate::lifecycle::mode::{policy_for, RuntimeMode};
use crate::lifecycle::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::lifecycle::signals::{ShutdownSignal, SignalError, SignalEvent, SignalIntercept};

/// How long a drained shutdown waits for the HTTP server to report it stopped.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(1);

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Signals(#[from] SignalError),
}

/// A started server: listener bound, accept loop running, coordinator idle.
pub struct App {
    coordinator: Arc<ShutdownCoordinator>,
    registry: DeferredRegistry,
    intercept: SignalIntercept,
    signals: mpsc::UnboundedReceiver<SignalEvent>,
    server: JoinHandle<Result<(), std::io::Error>>,
    local_addr: SocketAddr,
    mode: RuntimeMode,
}

impl App {
    /// Bind and start serving according to `config`.
    pub async fn start(config: ServerConfig) -> Result<Self, StartupError> {
        let mode = config.runtime.mode;
        let policy = policy_for(mode).with_drain_timeout(config.shutdown.drain_timeout());

        let registry = DeferredRegistry::new();
        let inflight = InFlightRequests::new();
        let coordinator = Arc::new(ShutdownCoordinator::new(policy, registry.clone(), inflight.clone()));
        let (intercept, signals) = SignalIntercept::new();

        tracing::info!(
            mode = %mode,
            wait_for_deferred_tasks = policy.wait_for_deferred_tasks,
            drain_timeout_ms = policy.drain_timeout.as_millis() as u64,
            "Shutdown policy selected"
        );

        let address = config.listener.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| StartupError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { address, source })?;

        let state = AppState {
            registry: registry.clone(),
            inflight,
            coordinator: coordinator.state(),
            mode,
            app: config.app.clone(),
        };
        let http = HttpServer::new(config, state);

        let shutdown = coordinator.shutdown().clone();
        let failure_intercept = intercept.clone();
        let server = tokio::spawn(async move {
            let result = http.run(listener, shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
                if !shutdown.is_triggered() {
                    failure_intercept.deliver(ShutdownSignal::Terminate);
                }
            }
            result
        });

        tracing::info!(address = %local_addr, "Listening for connections");

        Ok(Self {
            coordinator,
            registry,
            intercept,
            signals,
            server,
            local_addr,
            mode,
        })
    }

    /// Hook SIGINT and SIGTERM up to the coordinator.
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>, StartupError> {
        Ok(self.intercept.clone().install()?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn registry(&self) -> &DeferredRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Handle for delivering signals programmatically.
    pub fn intercept(&self) -> SignalIntercept {
        self.intercept.clone()
    }

    /// Block until a shutdown signal has been fully handled.
    pub async fn run_until_shutdown(self) -> ShutdownOutcome {
        let outcome = self.coordinator.run(self.signals).await;

        // Only a drained shutdown has time to spare for the server; the other
        // paths exit without waiting on anything.
        if outcome == ShutdownOutcome::Drained {
            match tokio::time::timeout(SERVER_STOP_GRACE, self.server).await {
                Ok(Ok(Err(e))) => tracing::warn!(error = %e, "HTTP server reported an error while stopping"),
                Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server task failed"),
                Err(_) => tracing::debug!("HTTP server still closing idle connections"),
                Ok(Ok(Ok(()))) => {}
            }
        }

        tracing::info!(
            outcome = outcome.as_str(),
            abandoned = outcome.abandoned(),
            exit_code = outcome.exit_code(),
            "shutdown complete"
        );
        outcome
    }
}
