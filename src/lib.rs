//! HTTP server with post-response ("deferred") work and a mode-aware
//! graceful shutdown.

pub mod config;
pub mod deferred;
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use deferred::{DeferredRegistry, TaskHandle, TaskState};
pub use http::{After, HttpServer};
pub use lifecycle::{App, RuntimeMode, ShutdownCoordinator, ShutdownOutcome};
