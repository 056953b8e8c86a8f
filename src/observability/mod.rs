//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events, stdout)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Operators and test harnesses grepping stdout for shutdown markers
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```
//!
//! # Shutdown markers
//! `deferred task started`, `deferred task finished`, `deferred task abandoned`,
//! `draining deferred tasks`, `all deferred tasks settled`,
//! `timed out waiting for deferred tasks`, `forced exit`, `shutdown complete`.

pub mod logging;
pub mod metrics;
