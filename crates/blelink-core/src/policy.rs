//! Reconnection policy.
//!
//! A policy run walks an ordered table of [`Tier`]s, least intrusive first,
//! until one of them settles the run:
//!
//! 1. [`Tier::InMemory`]: retry the peripheral the session still holds.
//! 2. [`Tier::Remembered`]: look up the remembered identifier among the
//!    previously granted peripherals and connect without flashing errors.
//! 3. [`Tier::Interactive`]: ask the user to pick a peripheral.
//!
//! Explicit user actions use all three tiers. The automatic run at startup
//! uses only [`Tier::Remembered`], since interactive selection needs a user
//! gesture on most platforms.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blelink_types::{ConnectResult, FailureReason, PeripheralRef, SessionState};

use crate::error::Stage;
use crate::session::{ConnectOptions, ConnectionStateMachine};
use crate::traits::{DurableStore, Status, StatusSink, Transport};

/// One strategy for re-establishing the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Reuse the peripheral held by the session.
    InMemory,
    /// Re-acquire the remembered peripheral through enumeration.
    Remembered,
    /// Interactive selection.
    Interactive,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::InMemory => write!(f, "in-memory"),
            Tier::Remembered => write!(f, "remembered"),
            Tier::Interactive => write!(f, "interactive"),
        }
    }
}

/// What triggered a policy run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Automatic run without a user gesture.
    Startup,
    /// Explicit user action.
    Explicit,
}

impl RunMode {
    /// The tier table for this mode, in order.
    pub fn tiers(self) -> &'static [Tier] {
        match self {
            RunMode::Startup => &[Tier::Remembered],
            RunMode::Explicit => &[Tier::InMemory, Tier::Remembered, Tier::Interactive],
        }
    }
}

/// Result of running one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierOutcome {
    /// The tier does not apply; move on without counting it.
    NotApplicable,
    /// The run ends with this result.
    Settled(ConnectResult),
    /// The tier failed; try the next one.
    Escalate(FailureReason),
}

/// Summary of a policy run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// What triggered the run.
    pub mode: RunMode,
    /// Tiers that were applicable, in the order they ran.
    pub attempted: Vec<Tier>,
    /// Final result, or `None` if no tier applied.
    pub result: Option<ConnectResult>,
    /// Session state when the run finished.
    pub state: SessionState,
}

impl RunReport {
    /// Whether the run ended connected.
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }
}

/// Orchestrates connection tiers on top of a [`ConnectionStateMachine`].
///
/// Runs are serialized: a user-triggered run waits for an in-flight startup
/// run instead of racing it for the session slot.
pub struct ReconnectionPolicy {
    machine: Arc<ConnectionStateMachine>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    sink: Arc<dyn StatusSink>,
    run_lock: tokio::sync::Mutex<()>,
    enumeration_diagnosed: AtomicBool,
}

impl ReconnectionPolicy {
    /// Create a policy.
    ///
    /// `transport` and `sink` should be the same capabilities the state
    /// machine was built with.
    pub fn new(
        machine: Arc<ConnectionStateMachine>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            machine,
            transport,
            store,
            sink,
            run_lock: tokio::sync::Mutex::new(()),
            enumeration_diagnosed: AtomicBool::new(false),
        }
    }

    /// The state machine driven by this policy.
    pub fn machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.machine
    }

    /// Explicit connect action. Outcomes are reported through the sink.
    pub async fn connect(&self) {
        let report = self.run(RunMode::Explicit).await;
        debug!(?report, "Explicit connect finished");
    }

    /// Automatic reconnection at process start.
    ///
    /// Does nothing if the platform cannot enumerate granted peripherals
    /// or no peripheral is remembered.
    pub async fn connect_on_startup(&self) {
        let report = self.run(RunMode::Startup).await;
        debug!(?report, "Startup reconnection finished");
    }

    /// Explicit run for a caller that cannot wait for a later user action.
    ///
    /// If the run stops in [`SessionState::WaitingForUserGesture`], the
    /// action that started it is taken as that gesture and the held
    /// peripheral is retried once.
    pub async fn run_user_action(&self) -> RunReport {
        let first = self.run(RunMode::Explicit).await;
        if first.state != SessionState::WaitingForUserGesture {
            return first;
        }

        info!("Retrying held peripheral with the current user action");
        let second = self.run(RunMode::Explicit).await;
        RunReport {
            attempted: first.attempted.into_iter().chain(second.attempted).collect(),
            ..second
        }
    }

    /// Run [`connect`](Self::connect) on the Tokio runtime and return at once.
    pub fn spawn_connect(self: &Arc<Self>) -> JoinHandle<()> {
        let policy = Arc::clone(self);
        tokio::spawn(async move { policy.connect().await })
    }

    /// Run [`connect_on_startup`](Self::connect_on_startup) on the Tokio runtime.
    pub fn spawn_startup(self: &Arc<Self>) -> JoinHandle<()> {
        let policy = Arc::clone(self);
        tokio::spawn(async move { policy.connect_on_startup().await })
    }

    /// Walk the tier table for `mode` and report what happened.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, mode: RunMode) -> RunReport {
        let _run = self.run_lock.lock().await;
        let mut attempted = Vec::new();

        if self.machine.state() == SessionState::Connected {
            info!("Already connected");
            self.sink.append("Already connected");
            return self.report(mode, attempted, Some(ConnectResult::Ok));
        }

        if mode == RunMode::Startup && !self.transport.supports_enumeration() {
            self.diagnose_enumeration();
            return self.report(mode, attempted, None);
        }

        let mut last_failure = None;
        for &tier in mode.tiers() {
            let outcome = match tier {
                Tier::InMemory => self.in_memory().await,
                Tier::Remembered => self.remembered().await,
                Tier::Interactive => self.interactive().await,
            };
            debug!(%tier, ?outcome, "Tier finished");

            match outcome {
                TierOutcome::NotApplicable => {}
                TierOutcome::Settled(result) => {
                    attempted.push(tier);
                    return self.report(mode, attempted, Some(result));
                }
                TierOutcome::Escalate(reason) => {
                    attempted.push(tier);
                    if reason.is_terminal() {
                        self.machine.surface_failure(&reason);
                        return self.report(mode, attempted, Some(ConnectResult::Failed(reason)));
                    }
                    last_failure = Some(reason);
                }
            }
        }

        // Only a table without the interactive tier gets here after a failure.
        let result = last_failure.map(|reason| {
            self.machine.mark_disconnected();
            ConnectResult::Failed(reason)
        });
        self.report(mode, attempted, result)
    }

    async fn in_memory(&self) -> TierOutcome {
        let Some(peripheral) = self.machine.current() else {
            return TierOutcome::NotApplicable;
        };

        info!(peripheral = %peripheral.id, "Retrying held peripheral");
        self.sink.append("Reconnecting to previous peripheral");
        match self
            .machine
            .attempt_connect(peripheral, ConnectOptions::suppressed())
            .await
        {
            ConnectResult::Ok => TierOutcome::Settled(ConnectResult::Ok),
            ConnectResult::Failed(reason) => TierOutcome::Escalate(reason),
        }
    }

    async fn remembered(&self) -> TierOutcome {
        let Some(id) = self.remembered_id() else {
            debug!("No remembered peripheral");
            return TierOutcome::NotApplicable;
        };
        if !self.transport.supports_enumeration() {
            debug!("Enumeration unsupported, skipping remembered peripheral");
            return TierOutcome::NotApplicable;
        }

        self.sink
            .set_status(Status::Text("Looking for remembered peripheral".to_string()));
        let granted = match self.transport.enumerate_granted().await {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Enumerating granted peripherals failed: {}", e);
                return self.remembered_unavailable(e.classify(Stage::Selection));
            }
        };

        let Some(peripheral) = granted.into_iter().find(|p| p.id == id) else {
            info!(peripheral = %id, "Remembered peripheral is no longer granted");
            return self.remembered_unavailable(FailureReason::DeviceNotFound);
        };

        info!(peripheral = %peripheral.id, "Reconnecting to remembered peripheral");
        self.sink.append("Reconnecting to remembered peripheral");
        match self
            .machine
            .attempt_connect(peripheral.clone(), ConnectOptions::suppressed())
            .await
        {
            ConnectResult::Ok => TierOutcome::Settled(ConnectResult::Ok),
            ConnectResult::Failed(reason) if reason.requires_user_gesture() => {
                self.await_gesture(peripheral, &reason);
                TierOutcome::Settled(ConnectResult::Failed(reason))
            }
            ConnectResult::Failed(reason) => self.remembered_unavailable(reason),
        }
    }

    async fn interactive(&self) -> TierOutcome {
        self.machine.enter_selection();
        self.sink.append("Requesting peripheral selection");

        let filter = self.machine.config().selection_filter();
        let peripheral = match self.transport.request_interactive(&filter).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                let reason = e.classify(Stage::Selection);
                if reason == FailureReason::UserCancelledSelection {
                    info!("Selection cancelled");
                    self.machine.mark_disconnected();
                    self.sink.append("Selection cancelled");
                } else {
                    self.machine.surface_failure(&reason);
                }
                return TierOutcome::Settled(ConnectResult::Failed(reason));
            }
        };

        self.remember(&peripheral);
        TierOutcome::Settled(
            self.machine
                .attempt_connect(peripheral, ConnectOptions::default())
                .await,
        )
    }

    fn remembered_id(&self) -> Option<String> {
        match self.store.get(&self.machine.config().store_key) {
            Ok(Some(id)) if !id.trim().is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                warn!("Reading remembered peripheral failed: {}", e);
                None
            }
        }
    }

    fn remember(&self, peripheral: &PeripheralRef) {
        let key = &self.machine.config().store_key;
        match self.store.set(key, &peripheral.id) {
            Ok(()) => debug!(peripheral = %peripheral.id, "Remembered peripheral"),
            Err(e) => warn!(peripheral = %peripheral.id, "Remembering peripheral failed: {}", e),
        }
    }

    fn remembered_unavailable(&self, reason: FailureReason) -> TierOutcome {
        self.sink.append("Remembered peripheral not available");
        TierOutcome::Escalate(reason)
    }

    fn await_gesture(&self, peripheral: PeripheralRef, reason: &FailureReason) {
        info!(peripheral = %peripheral.id, %reason, "Reconnection needs a user gesture");
        self.machine.await_user_gesture(peripheral);
        self.sink
            .append("Reconnection needs a user action; connect again to continue");
    }

    fn diagnose_enumeration(&self) {
        if !self.enumeration_diagnosed.swap(true, Ordering::SeqCst) {
            warn!("Transport cannot enumerate granted peripherals");
            self.sink.append(
                "Automatic reconnection unavailable: this platform cannot list previously granted peripherals",
            );
        }
    }

    fn report(
        &self,
        mode: RunMode,
        attempted: Vec<Tier>,
        result: Option<ConnectResult>,
    ) -> RunReport {
        RunReport {
            mode,
            attempted,
            result,
            state: self.machine.state(),
        }
    }
}

impl fmt::Debug for ReconnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectionPolicy")
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}
