//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → Mode → Policy → Registry + Coordinator → Listener
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → SignalEvent { First | Repeat } → coordinator
//!
//! Shutdown (shutdown.rs):
//!     First signal → stop accepting → drain or terminate → outcome → exit code
//!     Repeat signal while draining → forced exit
//! ```
//!
//! # Design Decisions
//! - Mode decides the policy (mode.rs); the coordinator only sees the policy
//! - Drain has a timeout: best-effort, then exit
//! - A second signal always wins over the drain

pub mod mode;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use mode::{policy_for, RuntimeMode, ShutdownPolicy};
pub use shutdown::{CoordinatorState, Shutdown, ShutdownCoordinator, ShutdownOutcome};
pub use signals::{Receipt, ShutdownSignal, SignalEvent, SignalIntercept};
pub use startup::{App, StartupError};
