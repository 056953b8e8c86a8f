//! OS signal handling.
//!
//! # Responsibilities
//! - Register handlers for SIGINT and SIGTERM
//! - Classify each receipt as the first or a repeat
//! - Forward events to the shutdown coordinator
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe); installing a handler replaces
//!   the default terminate action, so the coordinator decides when to exit
//! - Only the first receipt of any kind is `First`; every later one is a
//!   `Repeat`, which the coordinator treats as a force-exit request

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::observability::metrics;

/// Termination signals the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// SIGINT / Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a signal is the first shutdown request or a repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    First,
    Repeat,
}

/// A classified signal delivered to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signal: ShutdownSignal,
    pub receipt: Receipt,
}

impl SignalEvent {
    pub fn is_repeat(&self) -> bool {
        self.receipt == Receipt::Repeat
    }
}

/// Errors raised while installing signal handlers.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("failed to install {signal} handler: {source}")]
    Install {
        signal: ShutdownSignal,
        #[source]
        source: std::io::Error,
    },
}

/// Intercepts termination signals and forwards them to the coordinator.
#[derive(Debug, Clone)]
pub struct SignalIntercept {
    seen: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

impl SignalIntercept {
    /// Create an intercept and the receiver the coordinator listens on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SignalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                seen: Arc::new(AtomicBool::new(false)),
                tx,
            },
            rx,
        )
    }

    /// Classify and forward one signal receipt.
    pub fn deliver(&self, signal: ShutdownSignal) -> SignalEvent {
        let receipt = if self.seen.swap(true, Ordering::SeqCst) {
            Receipt::Repeat
        } else {
            Receipt::First
        };

        match receipt {
            Receipt::First => tracing::info!(signal = %signal, "shutdown signal received"),
            Receipt::Repeat => tracing::warn!(signal = %signal, "repeated shutdown signal received"),
        }
        metrics::record_signal(
            signal.as_str(),
            match receipt {
                Receipt::First => "first",
                Receipt::Repeat => "repeat",
            },
        );

        let event = SignalEvent { signal, receipt };
        if self.tx.send(event).is_err() {
            tracing::debug!(signal = %signal, "Coordinator no longer listening for signals");
        }
        event
    }

    /// Subscribe to SIGINT and SIGTERM and forward every receipt.
    ///
    /// Failing to install a handler is fatal at startup.
    #[cfg(unix)]
    pub fn install(self) -> Result<JoinHandle<()>, SignalError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt()).map_err(|source| SignalError::Install {
            signal: ShutdownSignal::Interrupt,
            source,
        })?;
        let mut terminate = signal(SignalKind::terminate()).map_err(|source| SignalError::Install {
            signal: ShutdownSignal::Terminate,
            source,
        })?;

        tracing::debug!("Signal handlers installed for SIGINT and SIGTERM");

        Ok(tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    received = interrupt.recv() => match received {
                        Some(()) => ShutdownSignal::Interrupt,
                        None => break,
                    },
                    received = terminate.recv() => match received {
                        Some(()) => ShutdownSignal::Terminate,
                        None => break,
                    },
                };
                self.deliver(signal);
            }
            tracing::debug!("Signal streams closed");
        }))
    }

    /// Subscribe to Ctrl+C and forward every receipt.
    #[cfg(not(unix))]
    pub fn install(self) -> Result<JoinHandle<()>, SignalError> {
        Ok(tokio::spawn(async move {
            loop {
                if let Err(source) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %source, "Failed to listen for Ctrl+C");
                    break;
                }
                self.deliver(ShutdownSignal::Interrupt);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_receipt_then_repeats() {
        let (intercept, mut rx) = SignalIntercept::new();

        let first = intercept.deliver(ShutdownSignal::Interrupt);
        let second = intercept.deliver(ShutdownSignal::Interrupt);
        let third = intercept.deliver(ShutdownSignal::Terminate);

        assert_eq!(first.receipt, Receipt::First);
        assert!(second.is_repeat());
        assert!(third.is_repeat());

        assert_eq!(rx.try_recv().unwrap(), first);
        assert_eq!(rx.try_recv().unwrap(), second);
        assert_eq!(rx.try_recv().unwrap(), third);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_the_first_flag() {
        let (intercept, _rx) = SignalIntercept::new();
        let other = intercept.clone();

        assert_eq!(other.deliver(ShutdownSignal::Terminate).receipt, Receipt::First);
        assert_eq!(intercept.deliver(ShutdownSignal::Interrupt).receipt, Receipt::Repeat);
    }

    #[test]
    fn concurrent_receipts_have_exactly_one_first() {
        let (intercept, _rx) = SignalIntercept::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let intercept = intercept.clone();
                std::thread::spawn(move || intercept.deliver(ShutdownSignal::Terminate).receipt)
            })
            .collect();

        let firsts = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|r| *r == Receipt::First)
            .count();
        assert_eq!(firsts, 1);
    }

    #[test]
    fn deliver_without_listener_does_not_panic() {
        let (intercept, rx) = SignalIntercept::new();
        drop(rx);
        assert_eq!(intercept.deliver(ShutdownSignal::Interrupt).receipt, Receipt::First);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_returns_live_listener() {
        let (intercept, _rx) = SignalIntercept::new();
        let listener = intercept.install().unwrap();
        assert!(!listener.is_finished());
        listener.abort();
    }
}
