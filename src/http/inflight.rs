//! In-flight request tracking.
//!
//! # Responsibilities
//! - Count requests currently inside a handler
//! - Let shutdown wait until that count reaches zero
//!
//! # Design Decisions
//! - A guard per request decrements on drop, so a panicking handler still releases its slot
//! - The count lives in a watch channel; waiters are woken on change instead of polling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Global counter for request sequence numbers, used only in trace output.
static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Tracks requests that have not produced a response yet.
#[derive(Debug, Clone)]
pub struct InFlightRequests {
    count: Arc<watch::Sender<usize>>,
}

impl InFlightRequests {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count: Arc::new(tx) }
    }

    /// Record a request entering the handler. The guard releases it on drop.
    pub fn track(&self) -> RequestGuard {
        self.count.send_modify(|n| *n += 1);
        RequestGuard {
            count: Arc::clone(&self.count),
            seq: REQUEST_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Current in-flight count.
    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no request is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender is owned by `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlightRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one in-flight request.
#[derive(Debug)]
pub struct RequestGuard {
    count: Arc<watch::Sender<usize>>,
    seq: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(request_seq = self.seq, "Request left handler");
    }
}
