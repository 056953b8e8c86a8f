//! Shutdown coordination for the server.
//!
//! # States
//! - Running: accepting connections, registry open
//! - Draining: accept loop stopped, waiting on in-flight requests and deferred tasks
//! - Terminating: registry closed, process about to exit
//!
//! # State Transitions
//! ```text
//! Running → Terminating: first signal, policy does not wait
//! Running → Draining: first signal, policy waits
//! Draining → Terminating: drained, drain timeout, or a repeated signal
//! Terminating → Terminating: no-op
//! ```
//!
//! # Design Decisions
//! - Every transition happens on the coordinator's `run` future or through
//!   `terminate`, which is guarded by a compare-and-set on the state channel
//! - The stop-accepting broadcast fires before any drain wait starts
//! - A drain timeout is not an error; the process still exits

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::deferred::{DeferredRegistry, DrainOutcome, TaskSnapshot};
use crate::http::inflight::InFlightRequests;
use crate::lifecycle::mode::ShutdownPolicy;
use crate::lifecycle::signals::{ShutdownSignal, SignalEvent};
use crate::observability::metrics;

/// Stop-accepting broadcast.
///
/// Long-running loops (the HTTP accept loop) wait on it; triggering it is
/// sticky, so a listener that subscribes late still observes it.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Create a new, untriggered broadcast.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Future that resolves once the broadcast has been triggered.
    pub fn signalled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|triggered| *triggered).await;
        }
    }

    /// Trigger the broadcast. Later calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_if_modified(|triggered| !std::mem::replace(triggered, true));
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of listeners currently waiting.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide shutdown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Running,
    Draining,
    Terminating,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Running => "running",
            CoordinatorState::Draining => "draining",
            CoordinatorState::Terminating => "terminating",
        }
    }
}

/// How the shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Policy did not wait; open tasks were abandoned.
    Immediate { abandoned: usize },
    /// Every deferred task settled before the deadline.
    Drained,
    /// The drain deadline passed; remaining tasks were abandoned.
    TimedOut { abandoned: usize },
    /// A repeated signal cut the drain short.
    Forced { abandoned: usize },
}

impl ShutdownOutcome {
    /// Process exit code for this outcome.
    ///
    /// Clean exits (drained, or not waiting by policy) are 0, a timed-out
    /// drain is 1 and a forced exit is 130.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownOutcome::Immediate { .. } | ShutdownOutcome::Drained => 0,
            ShutdownOutcome::TimedOut { .. } => 1,
            ShutdownOutcome::Forced { .. } => 130,
        }
    }

    /// Tasks abandoned on the way out.
    pub fn abandoned(&self) -> usize {
        match self {
            ShutdownOutcome::Drained => 0,
            ShutdownOutcome::Immediate { abandoned }
            | ShutdownOutcome::TimedOut { abandoned }
            | ShutdownOutcome::Forced { abandoned } => *abandoned,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Immediate { .. } => "immediate",
            ShutdownOutcome::Drained => "drained",
            ShutdownOutcome::TimedOut { .. } => "timed_out",
            ShutdownOutcome::Forced { .. } => "forced",
        }
    }
}

/// Coordinator for graceful shutdown.
pub struct ShutdownCoordinator {
    policy: ShutdownPolicy,
    registry: DeferredRegistry,
    inflight: InFlightRequests,
    shutdown: Shutdown,
    state: watch::Sender<CoordinatorState>,
}

impl ShutdownCoordinator {
    pub fn new(policy: ShutdownPolicy, registry: DeferredRegistry, inflight: InFlightRequests) -> Self {
        let (state, _) = watch::channel(CoordinatorState::Running);
        Self {
            policy,
            registry,
            inflight,
            shutdown: Shutdown::new(),
            state,
        }
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.policy
    }

    /// The stop-accepting broadcast the HTTP server listens on.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Wait for the first signal, then carry out the shutdown policy.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<SignalEvent>) -> ShutdownOutcome {
        let signal = match signals.recv().await {
            Some(event) => event.signal,
            None => {
                tracing::warn!("Signal channel closed; shutting down");
                ShutdownSignal::Terminate
            }
        };

        // Stop taking connections before deciding anything else.
        self.shutdown.trigger();

        if !self.policy.wait_for_deferred_tasks {
            let abandoned = self.terminate("policy does not wait for deferred tasks");
            tracing::info!(
                signal = %signal,
                abandoned,
                "Exiting without waiting for deferred tasks"
            );
            return ShutdownOutcome::Immediate { abandoned };
        }

        if !self.enter_draining() {
            // Someone already called `terminate`.
            return ShutdownOutcome::Forced { abandoned: 0 };
        }

        let started = Instant::now();
        let deadline = started + self.policy.drain_timeout;

        let repeat = async {
            match signals.recv().await {
                Some(event) => event,
                // No more signals can arrive; only the drain can end the wait.
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = self.drain(deadline) => match outcome {
                DrainOutcome::Drained => {
                    metrics::record_drain("drained", started.elapsed());
                    tracing::info!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "all deferred tasks settled"
                    );
                    let late = self.terminate("drain complete");
                    if late > 0 {
                        tracing::warn!(abandoned = late, "Tasks registered after the drain completed were abandoned");
                    }
                    ShutdownOutcome::Drained
                }
                DrainOutcome::TimedOut { remaining } => {
                    metrics::record_drain("timed_out", started.elapsed());
                    tracing::warn!(
                        timeout_ms = self.policy.drain_timeout.as_millis() as u64,
                        remaining = remaining.len(),
                        "timed out waiting for deferred tasks"
                    );
                    log_outstanding(&remaining);
                    let abandoned = self.terminate("drain timed out");
                    ShutdownOutcome::TimedOut { abandoned }
                }
            },
            event = repeat => {
                metrics::record_drain("forced", started.elapsed());
                tracing::warn!(
                    signal = %event.signal,
                    outstanding = self.registry.outstanding_count(),
                    in_flight = self.inflight.active_count(),
                    "forced exit: repeated shutdown signal"
                );
                let abandoned = self.terminate("forced exit");
                ShutdownOutcome::Forced { abandoned }
            }
        }
    }

    /// Enter Terminating and close the registry.
    ///
    /// Idempotent: only the first call abandons tasks; later calls return 0.
    pub fn terminate(&self, reason: &str) -> usize {
        let entered = self.state.send_if_modified(|state| {
            if *state == CoordinatorState::Terminating {
                false
            } else {
                *state = CoordinatorState::Terminating;
                true
            }
        });
        if !entered {
            tracing::debug!(reason, "Coordinator already terminating");
            return 0;
        }

        self.shutdown.trigger();
        let abandoned = self.registry.close();
        tracing::info!(reason, abandoned, "Coordinator terminating");
        abandoned
    }

    fn enter_draining(&self) -> bool {
        let entered = self.state.send_if_modified(|state| {
            if *state == CoordinatorState::Running {
                *state = CoordinatorState::Draining;
                true
            } else {
                false
            }
        });
        if entered {
            self.registry.begin_draining();
            tracing::info!(
                outstanding = self.registry.outstanding_count(),
                in_flight = self.inflight.active_count(),
                timeout_ms = self.policy.drain_timeout.as_millis() as u64,
                "draining deferred tasks"
            );
        }
        entered
    }

    /// In-flight requests first (they may still register tasks), then the registry.
    async fn drain(&self, deadline: Instant) -> DrainOutcome {
        if tokio::time::timeout_at(deadline, self.inflight.wait_idle()).await.is_err() {
            tracing::warn!(
                in_flight = self.inflight.active_count(),
                "In-flight requests still running at drain deadline"
            );
            return DrainOutcome::TimedOut {
                remaining: self.registry.snapshot(),
            };
        }

        match self.registry.await_all_settled(deadline).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Could not wait for deferred tasks");
                DrainOutcome::TimedOut {
                    remaining: self.registry.snapshot(),
                }
            }
        }
    }
}

fn log_outstanding(remaining: &[TaskSnapshot]) {
    for task in remaining {
        tracing::warn!(
            task_id = %task.id,
            owner = %task.owner,
            label = %task.label,
            state = %task.state,
            age_ms = task.age.as_millis() as u64,
            "deferred task still outstanding"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::TaskState;
    use crate::lifecycle::mode::{policy_for, RuntimeMode};
    use crate::lifecycle::signals::SignalIntercept;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Upper bound for an exit that is supposed to be immediate.
    const PROMPT_EXIT: Duration = Duration::from_millis(500);

    fn production(timeout_ms: u64) -> ShutdownPolicy {
        policy_for(RuntimeMode::Production).with_drain_timeout(Duration::from_millis(timeout_ms))
    }

    fn coordinator(policy: ShutdownPolicy) -> (Arc<ShutdownCoordinator>, DeferredRegistry, InFlightRequests) {
        let registry = DeferredRegistry::new();
        let inflight = InFlightRequests::new();
        let coordinator = Arc::new(ShutdownCoordinator::new(policy, registry.clone(), inflight.clone()));
        (coordinator, registry, inflight)
    }

    fn sleeper(registry: &DeferredRegistry, ms: u64, finished: Arc<AtomicBool>) -> crate::deferred::TaskHandle {
        registry.register("req-1", "sleep", move || async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            finished.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn shutdown_broadcast_is_sticky() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(50), shutdown.signalled())
            .await
            .expect("already-triggered broadcast resolves at once");
    }

    #[test]
    fn exit_codes_are_fixed() {
        assert_eq!(ShutdownOutcome::Drained.exit_code(), 0);
        assert_eq!(ShutdownOutcome::Immediate { abandoned: 3 }.exit_code(), 0);
        assert_eq!(ShutdownOutcome::TimedOut { abandoned: 1 }.exit_code(), 1);
        assert_eq!(ShutdownOutcome::Forced { abandoned: 1 }.exit_code(), 130);
    }

    #[tokio::test]
    async fn interactive_exits_without_waiting() {
        let (coordinator, registry, _) = coordinator(policy_for(RuntimeMode::Interactive));
        let finished = Arc::new(AtomicBool::new(false));
        let mut tasks: Vec<_> = (0..3).map(|_| sleeper(&registry, 5_000, finished.clone())).collect();
        for task in &mut tasks {
            task.started().await;
        }

        let (intercept, signals) = SignalIntercept::new();
        intercept.deliver(ShutdownSignal::Interrupt);

        let outcome = tokio::time::timeout(PROMPT_EXIT, coordinator.run(signals))
            .await
            .expect("interactive shutdown must not wait");

        assert_eq!(outcome, ShutdownOutcome::Immediate { abandoned: 3 });
        assert_eq!(coordinator.current_state(), CoordinatorState::Terminating);
        assert!(coordinator.shutdown().is_triggered());
        for task in &tasks {
            assert_eq!(task.state(), TaskState::Abandoned);
        }
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn production_waits_for_tasks() {
        let (coordinator, registry, _) = coordinator(production(2_000));
        let finished = Arc::new(AtomicBool::new(false));
        let mut task = sleeper(&registry, 200, finished.clone());
        task.started().await;

        let (intercept, signals) = SignalIntercept::new();
        intercept.deliver(ShutdownSignal::Terminate);

        let started = Instant::now();
        let outcome = coordinator.run(signals).await;

        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(finished.load(Ordering::SeqCst), "task must finish before shutdown returns");
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(task.state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn production_drain_times_out() {
        let (coordinator, registry, _) = coordinator(production(100));
        let finished = Arc::new(AtomicBool::new(false));
        let mut task = sleeper(&registry, 5_000, finished.clone());
        task.started().await;

        let (intercept, signals) = SignalIntercept::new();
        intercept.deliver(ShutdownSignal::Interrupt);

        let started = Instant::now();
        let outcome = coordinator.run(signals).await;

        assert_eq!(outcome, ShutdownOutcome::TimedOut { abandoned: 1 });
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(task.state(), TaskState::Abandoned);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn repeated_signal_forces_exit() {
        let (coordinator, registry, _) = coordinator(production(10_000));
        let finished = Arc::new(AtomicBool::new(false));
        let mut task = sleeper(&registry, 5_000, finished.clone());
        task.started().await;

        let (intercept, signals) = SignalIntercept::new();
        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(signals).await })
        };

        intercept.deliver(ShutdownSignal::Interrupt);
        let mut state = coordinator.state();
        state.wait_for(|s| *s == CoordinatorState::Draining).await.unwrap();

        intercept.deliver(ShutdownSignal::Terminate);
        let outcome = tokio::time::timeout(PROMPT_EXIT, run)
            .await
            .expect("forced exit must be prompt")
            .unwrap();

        assert_eq!(outcome, ShutdownOutcome::Forced { abandoned: 1 });
        assert_eq!(task.state(), TaskState::Abandoned);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let (coordinator, registry, _) = coordinator(production(1_000));
        let finished = Arc::new(AtomicBool::new(false));
        let mut a = sleeper(&registry, 5_000, finished.clone());
        let mut b = sleeper(&registry, 5_000, finished.clone());
        a.started().await;
        b.started().await;

        assert_eq!(coordinator.terminate("test"), 2);
        assert_eq!(coordinator.terminate("test again"), 0);
        assert_eq!(coordinator.current_state(), CoordinatorState::Terminating);
        assert_eq!(registry.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_in_flight_requests_and_their_tasks() {
        let (coordinator, registry, inflight) = coordinator(production(2_000));
        let finished = Arc::new(AtomicBool::new(false));

        // A request that is still inside its handler when the signal lands.
        let guard = inflight.track();
        let late = {
            let registry = registry.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let task = sleeper(&registry, 100, finished);
                drop(guard);
                task
            })
        };

        let (intercept, signals) = SignalIntercept::new();
        intercept.deliver(ShutdownSignal::Interrupt);
        let outcome = coordinator.run(signals).await;

        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(late.await.unwrap().state(), TaskState::Completed);
    }

    #[tokio::test]
    async fn drain_deadline_covers_stuck_in_flight_requests() {
        let (coordinator, registry, inflight) = coordinator(production(100));
        let finished = Arc::new(AtomicBool::new(false));
        let mut task = sleeper(&registry, 5_000, finished.clone());
        task.started().await;

        // Held past the deadline: the handler never returns.
        let _guard = inflight.track();

        let (intercept, signals) = SignalIntercept::new();
        intercept.deliver(ShutdownSignal::Interrupt);

        let started = Instant::now();
        let outcome = coordinator.run(signals).await;

        assert_eq!(outcome, ShutdownOutcome::TimedOut { abandoned: 1 });
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(inflight.active_count(), 1);
        assert_eq!(task.state(), TaskState::Abandoned);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn closed_signal_channel_starts_shutdown() {
        let (coordinator, _, _) = coordinator(production(100));
        let (intercept, signals) = SignalIntercept::new();
        drop(intercept);

        let outcome = coordinator.run(signals).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
    }
}
