//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing, timeout)
//!     → after.rs (in-flight tracking, release gate, After extractor)
//!     → handler (may register deferred work)
//!     → response sent; gate opens; deferred tasks start
//! ```

pub mod after;
pub mod inflight;
pub mod server;

pub use after::{After, X_REQUEST_ID};
pub use inflight::InFlightRequests;
pub use server::{AppState, HttpServer};
