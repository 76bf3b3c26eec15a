//! Connection state machine.
//!
//! [`ConnectionStateMachine`] owns the session record: the current
//! [`SessionState`], the single current [`PeripheralRef`], the generation
//! counter and the disconnect observer of the current generation. Every
//! mutation goes through one transition function, which also reports the
//! new state to the [`StatusSink`].
//!
//! A connection attempt never returns an error. Every transport failure is
//! classified into a [`FailureReason`] and returned in a [`ConnectResult`].
//!
//! # Generations
//!
//! Each attempt starts a new generation and registers a disconnect observer
//! bound to it before touching the transport. A disconnect event carrying an
//! older generation is ignored, so a late event from a previous link can
//! never tear down a newer session.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use blelink_types::{ConnectResult, FailureReason, PeripheralRef, SessionState};

use crate::config::LinkConfig;
use crate::error::{Error, Stage};
use crate::guard::Unregister;
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::traits::{DisconnectCallback, PayloadCallback, Status, StatusSink, Transport};

/// Options for a single connection attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// On failure, do not enter [`SessionState::Failed`].
    ///
    /// The state returns to where it was before the attempt (or
    /// `Disconnected` if that state held a peripheral) and no failure line is
    /// logged, leaving the caller to decide what to show.
    pub suppress_failure_state: bool,
}

impl ConnectOptions {
    /// Options for a background attempt that must not flash an error.
    pub fn suppressed() -> Self {
        Self {
            suppress_failure_state: true,
        }
    }
}

struct SessionRecord {
    state: SessionState,
    current: Option<PeripheralRef>,
    generation: u64,
    observer: Option<Unregister>,
    link_lost: bool,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            current: None,
            generation: 0,
            observer: None,
            link_lost: false,
        }
    }

    /// The single transition function of the session.
    fn transition(&mut self, sink: &dyn StatusSink, state: SessionState) {
        if !state.holds_peripheral() {
            self.current = None;
        }
        if self.state != state {
            debug!(from = %self.state, to = %state, generation = self.generation, "Session transition");
            self.state = state;
            sink.set_status(Status::State(state));
        }
    }
}

/// Why an attempt stopped before reaching `Connected`.
struct Aborted {
    reason: FailureReason,
    linked: bool,
}

impl Aborted {
    fn at(stage: Stage, linked: bool) -> impl FnOnce(Error) -> Self {
        move |err| {
            debug!(?stage, error = %err, "Connection step failed");
            Self {
                reason: err.classify(stage),
                linked,
            }
        }
    }

    fn link_lost() -> Self {
        Self {
            reason: FailureReason::DeviceNotFound,
            linked: false,
        }
    }
}

/// State machine driving a single peripheral session.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use blelink_core::mock::{MockTransport, RecordingSink};
/// use blelink_core::{ConnectOptions, ConnectionStateMachine, LinkConfig};
/// use blelink_types::{PeripheralRef, SessionState};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let transport = Arc::new(MockTransport::new());
/// let sink = Arc::new(RecordingSink::new());
/// let machine = ConnectionStateMachine::new(
///     transport,
///     sink,
///     LinkConfig::default(),
///     Arc::new(|payload: &[u8]| println!("{:02x?}", payload)),
/// );
///
/// let result = machine
///     .attempt_connect(PeripheralRef::with_name("abc123", "X"), ConnectOptions::default())
///     .await;
/// assert!(result.is_ok());
/// assert_eq!(machine.state(), SessionState::Connected);
/// # });
/// ```
pub struct ConnectionStateMachine {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn StatusSink>,
    config: LinkConfig,
    on_payload: PayloadCallback,
    record: Arc<Mutex<SessionRecord>>,
    subscriptions: Arc<SubscriptionManager>,
    attempt: tokio::sync::Mutex<()>,
    losses: Arc<watch::Sender<u64>>,
}

impl ConnectionStateMachine {
    /// Create a state machine delivering notification payloads to `on_payload`.
    pub fn new(
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StatusSink>,
        config: LinkConfig,
        on_payload: PayloadCallback,
    ) -> Self {
        let (losses, _) = watch::channel(0);
        Self {
            subscriptions: Arc::new(SubscriptionManager::new(Arc::clone(&transport))),
            transport,
            sink,
            config,
            on_payload,
            record: Arc::new(Mutex::new(SessionRecord::new())),
            attempt: tokio::sync::Mutex::new(()),
            losses: Arc::new(losses),
        }
    }

    /// Connect to `peripheral` and subscribe to the configured characteristic.
    ///
    /// Attempts on the same machine are serialized. Disconnect events from
    /// earlier generations are ignored; a disconnect event for this
    /// generation that arrives mid-attempt fails the attempt with
    /// [`FailureReason::DeviceNotFound`].
    #[tracing::instrument(skip_all, fields(peripheral = %peripheral.id, generation = tracing::field::Empty))]
    pub async fn attempt_connect(
        &self,
        peripheral: PeripheralRef,
        options: ConnectOptions,
    ) -> ConnectResult {
        let _attempt = self.attempt.lock().await;

        let (generation, prior, previous, replaced) = {
            let mut record = self.lock();
            record.generation += 1;
            record.link_lost = false;
            (
                record.generation,
                record.state,
                record.current.clone(),
                record.observer.take(),
            )
        };
        tracing::Span::current().record("generation", generation);
        drop(replaced);

        let observer = self
            .transport
            .on_disconnect(&peripheral, self.disconnect_observer(generation));
        {
            let mut record = self.lock();
            record.observer = Some(observer);
            record.current = Some(peripheral.clone());
            record.transition(self.sink.as_ref(), SessionState::Connecting);
        }

        self.subscriptions.unbind_active().await;
        if prior == SessionState::Connected
            && let Some(previous) = previous.filter(|p| p.id != peripheral.id)
        {
            debug!(previous = %previous.id, "Dropping link to replaced peripheral");
            if let Err(e) = self.transport.disconnect(&previous).await {
                warn!(previous = %previous.id, "Disconnect failed: {}", e);
            }
        }

        let outcome = match self.establish(&peripheral, generation).await {
            Ok(handle) => self.finish(&peripheral, generation, handle),
            Err(aborted) => Err(aborted),
        };

        match outcome {
            Ok(()) => ConnectResult::Ok,
            Err(aborted) => self.abort(&peripheral, prior, aborted, options).await,
        }
    }

    /// Voluntarily end the session.
    ///
    /// Removes the disconnect observer first so the link drop is not
    /// reported as a loss, then unsubscribes and asks the transport to drop
    /// the link.
    #[tracing::instrument(skip(self))]
    pub async fn disconnect(&self) {
        let _attempt = self.attempt.lock().await;

        let (peripheral, observer) = {
            let mut record = self.lock();
            record.generation += 1;
            (record.current.clone(), record.observer.take())
        };
        drop(observer);

        self.subscriptions.unbind_active().await;
        if let Some(peripheral) = &peripheral
            && let Err(e) = self.transport.disconnect(peripheral).await
        {
            warn!(peripheral = %peripheral.id, "Disconnect failed: {}", e);
        }

        self.lock()
            .transition(self.sink.as_ref(), SessionState::Disconnected);
        if peripheral.is_some() {
            self.sink.append("Disconnected");
            info!("Session closed");
        }
    }

    /// Hold `peripheral` until the user acts again.
    pub fn await_user_gesture(&self, peripheral: PeripheralRef) {
        let mut record = self.lock();
        record.current = Some(peripheral);
        record.transition(self.sink.as_ref(), SessionState::WaitingForUserGesture);
    }

    /// Enter interactive selection, releasing any current peripheral.
    pub fn enter_selection(&self) {
        self.lock()
            .transition(self.sink.as_ref(), SessionState::RequestingSelection);
    }

    /// Return to `Disconnected` without logging a failure.
    pub fn mark_disconnected(&self) {
        self.lock()
            .transition(self.sink.as_ref(), SessionState::Disconnected);
    }

    /// Enter `Failed` and log `reason`.
    pub fn surface_failure(&self, reason: &FailureReason) {
        self.lock()
            .transition(self.sink.as_ref(), SessionState::Failed);
        self.sink.append(&format!("Connection failed: {}", reason));
        warn!(%reason, "Connection failed");
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// The current peripheral, if the state holds one.
    pub fn current(&self) -> Option<PeripheralRef> {
        self.lock().current.clone()
    }

    /// Generation of the most recent attempt or voluntary disconnect.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// The subscription manager owned by this machine.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// The link profile used for every attempt.
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Watch transport-signalled link losses.
    ///
    /// The value counts losses of a `Connected` session; voluntary
    /// disconnects and stale events do not change it.
    pub fn link_losses(&self) -> watch::Receiver<u64> {
        self.losses.subscribe()
    }

    async fn establish(
        &self,
        peripheral: &PeripheralRef,
        generation: u64,
    ) -> std::result::Result<SubscriptionHandle, Aborted> {
        let server = self
            .transport
            .connect(peripheral)
            .await
            .map_err(Aborted::at(Stage::Link, false))?;
        self.ensure_link(generation)?;

        let service = self
            .transport
            .resolve_service(&server, self.config.service)
            .await
            .map_err(Aborted::at(Stage::Negotiation, true))?;
        let characteristic = self
            .transport
            .resolve_characteristic(&service, self.config.characteristic)
            .await
            .map_err(Aborted::at(Stage::Negotiation, true))?;
        self.ensure_link(generation)?;

        self.subscriptions
            .bind(characteristic, Arc::clone(&self.on_payload))
            .await
            .map_err(Aborted::at(Stage::Subscribe, true))
    }

    fn ensure_link(&self, generation: u64) -> std::result::Result<(), Aborted> {
        let record = self.lock();
        if record.link_lost || record.generation != generation {
            debug!(generation, "Link lost during attempt");
            return Err(Aborted::link_lost());
        }
        Ok(())
    }

    fn finish(
        &self,
        peripheral: &PeripheralRef,
        generation: u64,
        handle: SubscriptionHandle,
    ) -> std::result::Result<(), Aborted> {
        let mut record = self.lock();
        if record.link_lost || record.generation != generation {
            drop(record);
            self.subscriptions.release(&handle);
            return Err(Aborted::link_lost());
        }
        record.transition(self.sink.as_ref(), SessionState::Connected);
        drop(record);

        self.sink.append(&format!("Connected to {}", peripheral));
        info!(subscription = handle.id(), "Connected");
        Ok(())
    }

    async fn abort(
        &self,
        peripheral: &PeripheralRef,
        prior: SessionState,
        aborted: Aborted,
        options: ConnectOptions,
    ) -> ConnectResult {
        if aborted.linked
            && let Err(e) = self.transport.disconnect(peripheral).await
        {
            debug!("Dropping half-open link failed: {}", e);
        }

        let reason = aborted.reason;
        {
            let mut record = self.lock();
            record.current = None;
            let next = if !options.suppress_failure_state {
                SessionState::Failed
            } else if prior.holds_peripheral() {
                SessionState::Disconnected
            } else {
                prior
            };
            record.transition(self.sink.as_ref(), next);
        }

        if options.suppress_failure_state {
            info!(%reason, "Connection attempt failed quietly");
        } else {
            self.sink.append(&format!("Connection failed: {}", reason));
            warn!(%reason, "Connection attempt failed");
        }
        ConnectResult::Failed(reason)
    }

    fn disconnect_observer(&self, generation: u64) -> DisconnectCallback {
        let record = Arc::clone(&self.record);
        let subscriptions = Arc::clone(&self.subscriptions);
        let sink = Arc::clone(&self.sink);
        let losses = Arc::clone(&self.losses);

        Arc::new(move || {
            let mut guard = lock(&record);
            if guard.generation != generation {
                debug!(
                    generation,
                    current = guard.generation,
                    "Ignoring stale disconnect event"
                );
                return;
            }
            match guard.state {
                SessionState::Connecting => {
                    guard.link_lost = true;
                    debug!(generation, "Link dropped while connecting");
                }
                SessionState::Connected => {
                    let observer = guard.observer.take();
                    subscriptions.release_active();
                    guard.transition(sink.as_ref(), SessionState::Disconnected);
                    drop(guard);
                    drop(observer);

                    sink.append("Link lost");
                    info!(generation, "Peripheral disconnected");
                    losses.send_modify(|count| *count += 1);
                }
                state => debug!(generation, %state, "Ignoring disconnect event"),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        lock(&self.record)
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.lock();
        f.debug_struct("ConnectionStateMachine")
            .field("state", &record.state)
            .field("current", &record.current)
            .field("generation", &record.generation)
            .finish_non_exhaustive()
    }
}

fn lock(record: &Mutex<SessionRecord>) -> MutexGuard<'_, SessionRecord> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::mock::{MockFailure, MockTransport, RecordingSink};

    struct Harness {
        transport: Arc<MockTransport>,
        sink: Arc<RecordingSink>,
        machine: Arc<ConnectionStateMachine>,
        payloads: Arc<AtomicU32>,
    }

    fn harness(transport: MockTransport) -> Harness {
        let transport = Arc::new(transport);
        let sink = Arc::new(RecordingSink::new());
        let payloads = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&payloads);
        let machine = Arc::new(ConnectionStateMachine::new(
            transport.clone(),
            sink.clone(),
            LinkConfig::default(),
            Arc::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        Harness {
            transport,
            sink,
            machine,
            payloads,
        }
    }

    fn sensor() -> PeripheralRef {
        PeripheralRef::with_name("abc123", "X")
    }

    #[tokio::test]
    async fn test_successful_attempt() {
        let h = harness(MockTransport::new());

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(result, ConnectResult::Ok);
        assert_eq!(h.machine.state(), SessionState::Connected);
        assert_eq!(h.machine.current(), Some(sensor()));
        assert_eq!(h.machine.generation(), 1);
        assert_eq!(
            h.sink.statuses(),
            vec![
                Status::State(SessionState::Connecting),
                Status::State(SessionState::Connected)
            ]
        );
        assert_eq!(h.sink.lines(), vec!["Connected to X (abc123)".to_string()]);

        h.transport.emit_payload(&[1, 2]);
        assert_eq!(h.payloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_enters_failed_state() {
        let h = harness(MockTransport::new());
        h.transport.set_unreachable("abc123", true);

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(result, ConnectResult::Failed(FailureReason::DeviceNotFound));
        assert_eq!(h.machine.state(), SessionState::Failed);
        assert!(h.machine.current().is_none());
        assert_eq!(h.sink.lines_containing("Connection failed").len(), 1);
    }

    #[tokio::test]
    async fn test_suppressed_failure_restores_prior_state() {
        let h = harness(MockTransport::new());
        h.transport.fail_next_connect("abc123", MockFailure::NotFound);

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::suppressed())
            .await;

        assert!(result.is_failed());
        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert!(h.machine.current().is_none());
        assert!(h.sink.lines().is_empty());
        assert!(
            !h.sink
                .statuses()
                .contains(&Status::State(SessionState::Failed))
        );
    }

    #[tokio::test]
    async fn test_permission_failure_classification() {
        let h = harness(MockTransport::new());
        h.transport.fail_next_connect(
            "abc123",
            MockFailure::PermissionDenied("SecurityError".into()),
        );

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::suppressed())
            .await;
        assert_eq!(
            result,
            ConnectResult::Failed(FailureReason::PermissionOrSecurityDenied)
        );
    }

    #[tokio::test]
    async fn test_negotiation_failure_drops_link() {
        let h = harness(MockTransport::builder().services(vec![]).build());

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(
            result,
            ConnectResult::Failed(FailureReason::ProtocolNegotiationFailed)
        );
        assert_eq!(h.transport.disconnect_calls(), 1);
        assert!(!h.transport.is_linked("abc123"));
        assert!(!h.machine.subscriptions().is_bound());
    }

    #[tokio::test]
    async fn test_subscribe_failure_is_negotiation_failure() {
        let h = harness(MockTransport::builder().fail_subscribe("CCCD write failed").build());

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(
            result,
            ConnectResult::Failed(FailureReason::ProtocolNegotiationFailed)
        );
        assert!(h.machine.subscriptions().active().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_event_tears_down_session() {
        let h = harness(MockTransport::new());
        let mut losses = h.machine.link_losses();
        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(h.transport.fire_disconnect("abc123"), 1);

        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert!(h.machine.current().is_none());
        assert!(!h.machine.subscriptions().is_bound());
        assert_eq!(h.transport.observer_count(), 0);
        assert!(losses.has_changed().unwrap());
        assert_eq!(*losses.borrow_and_update(), 1);

        h.transport.emit_payload(&[9]);
        assert_eq!(h.payloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_disconnect_event_is_ignored() {
        let h = harness(MockTransport::builder().leaky_observers().build());
        let old = PeripheralRef::new("old");

        h.machine
            .attempt_connect(old, ConnectOptions::default())
            .await;
        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;
        assert_eq!(h.machine.generation(), 2);

        // Generation 1's observer is still registered with the transport.
        assert_eq!(h.transport.fire_disconnect("old"), 1);

        assert_eq!(h.machine.state(), SessionState::Connected);
        assert_eq!(h.machine.current(), Some(sensor()));
        assert!(h.machine.subscriptions().is_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_fails_attempt() {
        let h = harness(
            MockTransport::builder()
                .connect_delay(Duration::from_millis(100))
                .build(),
        );

        let machine = Arc::clone(&h.machine);
        let attempt = tokio::spawn(async move {
            machine
                .attempt_connect(sensor(), ConnectOptions::default())
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.machine.state(), SessionState::Connecting);
        h.transport.fire_disconnect("abc123");

        let result = attempt.await.unwrap();
        assert_eq!(result, ConnectResult::Failed(FailureReason::DeviceNotFound));
        assert_eq!(h.machine.state(), SessionState::Failed);
        assert!(!h.machine.subscriptions().is_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_serialized() {
        let h = harness(
            MockTransport::builder()
                .connect_delay(Duration::from_millis(50))
                .build(),
        );

        let first = {
            let machine = Arc::clone(&h.machine);
            tokio::spawn(async move {
                machine
                    .attempt_connect(sensor(), ConnectOptions::default())
                    .await
            })
        };
        let second = {
            let machine = Arc::clone(&h.machine);
            tokio::spawn(async move {
                machine
                    .attempt_connect(sensor(), ConnectOptions::default())
                    .await
            })
        };

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(h.transport.max_concurrent_connects(), 1);
        assert_eq!(h.machine.generation(), 2);
        assert_eq!(h.transport.unsubscribe_calls(), 1);

        h.transport.emit_payload(&[1]);
        assert_eq!(h.payloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_voluntary_disconnect() {
        let h = harness(MockTransport::new());
        let losses = h.machine.link_losses();
        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        h.machine.disconnect().await;

        assert_eq!(h.machine.state(), SessionState::Disconnected);
        assert_eq!(h.transport.unsubscribe_calls(), 1);
        assert_eq!(h.transport.disconnect_calls(), 1);
        assert_eq!(h.transport.observer_count(), 0);
        assert!(!losses.has_changed().unwrap());
        assert_eq!(h.sink.lines().last().map(String::as_str), Some("Disconnected"));
    }

    #[tokio::test]
    async fn test_switching_peripheral_drops_previous_link() {
        let h = harness(MockTransport::new());
        let other = PeripheralRef::with_name("def456", "Y");

        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;
        let result = h
            .machine
            .attempt_connect(other.clone(), ConnectOptions::default())
            .await;

        assert!(result.is_ok());
        assert_eq!(h.machine.current(), Some(other));
        assert!(!h.transport.is_linked("abc123"));
        assert!(h.transport.is_linked("def456"));
        assert_eq!(h.transport.disconnect_calls(), 1);
        assert_eq!(h.transport.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_reattempt_same_peripheral_keeps_link() {
        let h = harness(MockTransport::new());

        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;
        h.machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(h.transport.disconnect_calls(), 0);
        assert_eq!(h.machine.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_negotiation_failure() {
        let h = harness(MockTransport::builder().characteristics(vec![]).build());

        let result = h
            .machine
            .attempt_connect(sensor(), ConnectOptions::default())
            .await;

        assert_eq!(
            result,
            ConnectResult::Failed(FailureReason::ProtocolNegotiationFailed)
        );
        assert_eq!(h.transport.subscribe_calls(), 0);
        assert!(!h.transport.is_linked("abc123"));
    }

    #[test]
    fn test_await_user_gesture_retains_peripheral() {
        let h = harness(MockTransport::new());
        h.machine.await_user_gesture(sensor());
        assert_eq!(h.machine.state(), SessionState::WaitingForUserGesture);
        assert_eq!(h.machine.current(), Some(sensor()));

        h.machine.enter_selection();
        assert_eq!(h.machine.state(), SessionState::RequestingSelection);
        assert!(h.machine.current().is_none());
    }
}
