//! Deferred (post-response) work.
//!
//! # Data Flow
//! ```text
//! handler → After extractor → registry.register_after(owner, gate, action)
//!     → entry stored Pending, runner spawned
//!     → response ready → gate opens → Running → action
//!     → Completed (ok or error recorded) → entry reaped
//!
//! shutdown:
//!     coordinator → registry.await_all_settled(deadline)   (production)
//!     coordinator → registry.close() → open tasks Abandoned
//! ```

pub mod registry;
pub mod task;

pub use registry::{Admission, DeferredRegistry, DrainOutcome, RegistryError};
pub use task::{BoxError, TaskHandle, TaskId, TaskResult, TaskSnapshot, TaskState};
