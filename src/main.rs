//! deferred-server
//!
//! An HTTP server whose handlers can schedule work to run after the response
//! is sent, with a shutdown that honors the runtime mode:
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!   Request  ────▶│ request-id → trace → timeout → defer_after_response │
//!                 │                                    │                 │
//!                 │                              handler + After         │
//!                 │                                    │ register        │
//!                 │                                    ▼                 │
//!                 │                           DeferredRegistry           │
//!                 │                                    ▲                 │
//!   SIGINT/TERM ─▶│ SignalIntercept ──▶ ShutdownCoordinator (policy)     │
//!                 └──────────────────────────────────────────────────────┘
//! ```
//!
//! Interactive mode exits on the first signal and abandons deferred work.
//! Production mode stops accepting, waits for in-flight requests and deferred
//! tasks (bounded by the drain timeout), and exits; a second signal forces exit.

use std::path::PathBuf;

use clap::Parser;

use deferred_server::config::{self, validation::validate_config, ConfigError, ServerConfig};
use deferred_server::lifecycle::{App, RuntimeMode};
use deferred_server::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "deferred-server")]
#[command(about = "HTTP server that drains post-response work on shutdown", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Runtime mode; overrides `runtime.mode`.
    #[arg(short, long, value_enum)]
    mode: Option<RuntimeMode>,

    /// Bind address; overrides `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Production drain timeout in milliseconds; overrides `shutdown.drain_timeout_ms`.
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Sleep of the demo deferred task in milliseconds; overrides `app.after_sleep_ms`.
    #[arg(long)]
    after_sleep_ms: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => config::load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(mode) = self.mode {
            config.runtime.mode = mode;
        }
        if let Some(bind) = self.bind {
            config.listener.bind_address = bind;
        }
        if let Some(ms) = self.drain_timeout_ms {
            config.shutdown.drain_timeout_ms = ms;
        }
        if let Some(ms) = self.after_sleep_ms {
            config.app.after_sleep_ms = ms;
        }

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;

    logging::init_logging(&config.observability)?;

    tracing::info!(
        mode = %config.runtime.mode,
        bind_address = %config.listener.bind_address,
        drain_timeout_ms = config.shutdown.drain_timeout_ms,
        request_timeout_secs = config.timeouts.request_secs,
        "deferred-server v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let app = App::start(config).await?;
    app.install_signal_handlers()?;

    let outcome = app.run_until_shutdown().await;
    std::process::exit(outcome.exit_code());
}
