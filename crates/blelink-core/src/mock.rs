//! In-memory capability fakes for testing.
//!
//! This module provides a mock transport, durable store and status sink
//! that can be used for unit testing without requiring BLE hardware.
//!
//! # Features
//!
//! - **Call accounting**: every transport call is counted, so tests can
//!   assert that a code path touched the radio zero times
//! - **Failure injection**: one-shot or persistent failures per peripheral
//!   and per phase
//! - **Event injection**: deliver payloads and link-loss events on demand
//! - **Latency simulation**: delay connects to exercise in-flight races

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use blelink_types::PeripheralRef;
use blelink_types::uuid::{DEFAULT_CHARACTERISTIC, DEFAULT_SERVICE};

use crate::config::SelectionFilter;
use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::guard::Unregister;
use crate::traits::{
    CharacteristicHandle, DisconnectCallback, DurableStore, PayloadCallback, ServerHandle,
    ServiceHandle, Status, StatusSink, Transport,
};

/// A clonable description of an injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// The user dismissed the chooser.
    Cancelled,
    /// Security or permission refusal with platform detail.
    PermissionDenied(String),
    /// The peripheral is out of range.
    NotFound,
    /// The operation timed out.
    Timeout,
    /// The capability is missing.
    Unsupported,
    /// Opaque platform failure.
    Other(String),
}

impl MockFailure {
    fn to_error(&self, identifier: &str) -> Error {
        match self {
            MockFailure::Cancelled => Error::Cancelled,
            MockFailure::PermissionDenied(detail) => Error::PermissionDenied(detail.clone()),
            MockFailure::NotFound => Error::device_not_found(identifier),
            MockFailure::Timeout => Error::timeout("connect", Duration::from_secs(10)),
            MockFailure::Unsupported => Error::Unsupported("mock capability".to_string()),
            MockFailure::Other(detail) => Error::Other(detail.clone()),
        }
    }
}

type Observers = HashMap<String, Vec<(u64, DisconnectCallback)>>;

#[derive(Default)]
struct Counters {
    capability_checks: AtomicU32,
    request: AtomicU32,
    enumerate: AtomicU32,
    connect: AtomicU32,
    resolve_service: AtomicU32,
    resolve_characteristic: AtomicU32,
    subscribe: AtomicU32,
    unsubscribe: AtomicU32,
    disconnect: AtomicU32,
    connects_in_flight: AtomicU32,
    max_connects_in_flight: AtomicU32,
}

/// A mock GATT transport.
///
/// Listeners passed to [`Transport::subscribe`] stay registered after
/// [`Transport::unsubscribe`], the way event listeners on a real
/// characteristic object do; only the notifying flag is cleared.
///
/// # Example
///
/// ```
/// use blelink_core::mock::MockTransport;
/// use blelink_core::Transport;
/// use blelink_types::PeripheralRef;
///
/// # tokio_test_block_on(async {
/// let transport = MockTransport::builder()
///     .granted(PeripheralRef::with_name("abc123", "X"))
///     .build();
/// let granted = transport.enumerate_granted().await.unwrap();
/// assert_eq!(granted.len(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub struct MockTransport {
    enumeration: bool,
    leaky_observers: bool,
    connect_delay: Duration,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    granted: Mutex<Vec<PeripheralRef>>,
    selections: Mutex<VecDeque<std::result::Result<PeripheralRef, MockFailure>>>,
    enumerate_failure: Mutex<Option<MockFailure>>,
    connect_failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    unreachable: Mutex<HashSet<String>>,
    subscribe_failure: Mutex<Option<String>>,
    listeners: Mutex<Vec<(CharacteristicHandle, PayloadCallback)>>,
    notifying: Mutex<HashSet<String>>,
    linked: Mutex<HashSet<String>>,
    observers: Arc<Mutex<Observers>>,
    next_token: AtomicU64,
    counters: Counters,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("enumeration", &self.enumeration)
            .field("granted", &*lock(&self.granted))
            .field("linked", &*lock(&self.linked))
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransportBuilder::new().build()
    }
}

impl MockTransport {
    /// Create a mock transport with default behavior.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder.
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::new()
    }

    // --- Injection ---

    /// Fail the next connect to `id` with `failure`.
    pub fn fail_next_connect(&self, id: &str, failure: MockFailure) {
        lock(&self.connect_failures)
            .entry(id.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Make `id` permanently unreachable (or reachable again).
    pub fn set_unreachable(&self, id: &str, unreachable: bool) {
        let mut set = lock(&self.unreachable);
        if unreachable {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    /// Deliver a payload to every listener on a notifying characteristic.
    ///
    /// Returns the number of listeners invoked (gated listeners included).
    pub fn emit_payload(&self, data: &[u8]) -> usize {
        let notifying = lock(&self.notifying).clone();
        let targets: Vec<PayloadCallback> = lock(&self.listeners)
            .iter()
            .filter(|(characteristic, _)| notifying.contains(&characteristic.to_string()))
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in &targets {
            callback(data);
        }
        targets.len()
    }

    /// Simulate a link loss reported by the platform for `id`.
    ///
    /// Returns the number of observers notified.
    pub fn fire_disconnect(&self, id: &str) -> usize {
        lock(&self.linked).remove(id);
        let callbacks: Vec<DisconnectCallback> = lock(&self.observers)
            .get(id)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    // --- Inspection ---

    /// Number of capability checks performed.
    pub fn capability_checks(&self) -> u32 {
        self.counters.capability_checks.load(Ordering::SeqCst)
    }

    /// Number of interactive selection requests.
    pub fn request_calls(&self) -> u32 {
        self.counters.request.load(Ordering::SeqCst)
    }

    /// Number of enumeration calls.
    pub fn enumerate_calls(&self) -> u32 {
        self.counters.enumerate.load(Ordering::SeqCst)
    }

    /// Number of connect calls.
    pub fn connect_calls(&self) -> u32 {
        self.counters.connect.load(Ordering::SeqCst)
    }

    /// Number of subscribe calls.
    pub fn subscribe_calls(&self) -> u32 {
        self.counters.subscribe.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls.
    pub fn unsubscribe_calls(&self) -> u32 {
        self.counters.unsubscribe.load(Ordering::SeqCst)
    }

    /// Number of voluntary disconnect calls.
    pub fn disconnect_calls(&self) -> u32 {
        self.counters.disconnect.load(Ordering::SeqCst)
    }

    /// Every transport call except capability checks.
    pub fn total_calls(&self) -> u32 {
        let c = &self.counters;
        [
            &c.request,
            &c.enumerate,
            &c.connect,
            &c.resolve_service,
            &c.resolve_characteristic,
            &c.subscribe,
            &c.unsubscribe,
            &c.disconnect,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::SeqCst))
        .sum()
    }

    /// Highest number of connects that were in flight at the same time.
    pub fn max_concurrent_connects(&self) -> u32 {
        self.counters.max_connects_in_flight.load(Ordering::SeqCst)
    }

    /// Number of registered disconnect observers across all peripherals.
    pub fn observer_count(&self) -> usize {
        lock(&self.observers).values().map(Vec::len).sum()
    }

    /// Whether `id` currently has a link.
    pub fn is_linked(&self, id: &str) -> bool {
        lock(&self.linked).contains(id)
    }

    fn check_link(&self, peripheral: &PeripheralRef) -> Result<()> {
        if lock(&self.linked).contains(&peripheral.id) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn supports_enumeration(&self) -> bool {
        self.counters.capability_checks.fetch_add(1, Ordering::SeqCst);
        self.enumeration
    }

    async fn request_interactive(&self, filter: &SelectionFilter) -> Result<PeripheralRef> {
        self.counters.request.fetch_add(1, Ordering::SeqCst);
        match lock(&self.selections).pop_front() {
            Some(Ok(peripheral)) if filter.matches_name(peripheral.name.as_deref()) => {
                Ok(peripheral)
            }
            Some(Ok(_)) => Err(Error::DeviceNotFound(DeviceNotFoundReason::NoDevicesInRange)),
            Some(Err(failure)) => Err(failure.to_error("chooser")),
            None => Err(Error::Cancelled),
        }
    }

    async fn enumerate_granted(&self) -> Result<Vec<PeripheralRef>> {
        self.counters.enumerate.fetch_add(1, Ordering::SeqCst);
        if !self.enumeration {
            return Err(Error::Unsupported("enumerate_granted".to_string()));
        }
        if let Some(failure) = lock(&self.enumerate_failure).take() {
            return Err(failure.to_error("enumeration"));
        }
        Ok(lock(&self.granted).clone())
    }

    async fn connect(&self, peripheral: &PeripheralRef) -> Result<ServerHandle> {
        self.counters.connect.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.counters.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_connects_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let failure = lock(&self.connect_failures)
            .get_mut(&peripheral.id)
            .and_then(VecDeque::pop_front);
        let result = match failure {
            Some(failure) => Err(failure.to_error(&peripheral.id)),
            None if lock(&self.unreachable).contains(&peripheral.id) => {
                Err(Error::device_not_found(&peripheral.id))
            }
            None => {
                lock(&self.linked).insert(peripheral.id.clone());
                Ok(ServerHandle {
                    peripheral: peripheral.clone(),
                })
            }
        };

        self.counters.connects_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn resolve_service(&self, server: &ServerHandle, service: Uuid) -> Result<ServiceHandle> {
        self.counters.resolve_service.fetch_add(1, Ordering::SeqCst);
        self.check_link(&server.peripheral)?;
        if !self.services.contains(&service) {
            return Err(Error::service_not_found(service));
        }
        Ok(ServiceHandle {
            peripheral: server.peripheral.clone(),
            uuid: service,
        })
    }

    async fn resolve_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle> {
        self.counters
            .resolve_characteristic
            .fetch_add(1, Ordering::SeqCst);
        self.check_link(&service.peripheral)?;
        if !self.characteristics.contains(&characteristic) {
            return Err(Error::characteristic_not_found(characteristic, service.uuid));
        }
        Ok(CharacteristicHandle {
            peripheral: service.peripheral.clone(),
            service: service.uuid,
            uuid: characteristic,
        })
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
        on_payload: PayloadCallback,
    ) -> Result<()> {
        self.counters.subscribe.fetch_add(1, Ordering::SeqCst);
        if let Some(detail) = lock(&self.subscribe_failure).clone() {
            return Err(Error::Other(detail));
        }
        lock(&self.listeners).push((characteristic.clone(), on_payload));
        lock(&self.notifying).insert(characteristic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        self.counters.unsubscribe.fetch_add(1, Ordering::SeqCst);
        lock(&self.notifying).remove(&characteristic.to_string());
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralRef) -> Result<()> {
        self.counters.disconnect.fetch_add(1, Ordering::SeqCst);
        lock(&self.linked).remove(&peripheral.id);
        Ok(())
    }

    fn on_disconnect(&self, peripheral: &PeripheralRef, callback: DisconnectCallback) -> Unregister {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&self.observers)
            .entry(peripheral.id.clone())
            .or_default()
            .push((token, callback));

        if self.leaky_observers {
            return Unregister::noop();
        }

        let observers = Arc::clone(&self.observers);
        let id = peripheral.id.clone();
        Unregister::new(move || {
            if let Some(entries) = lock(&observers).get_mut(&id) {
                entries.retain(|(t, _)| *t != token);
            }
        })
    }
}

/// Builder for [`MockTransport`].
#[derive(Debug, Clone)]
pub struct MockTransportBuilder {
    enumeration: bool,
    leaky_observers: bool,
    connect_delay: Duration,
    services: Vec<Uuid>,
    characteristics: Vec<Uuid>,
    granted: Vec<PeripheralRef>,
    selections: Vec<std::result::Result<PeripheralRef, MockFailure>>,
    enumerate_failure: Option<MockFailure>,
    subscribe_failure: Option<String>,
}

impl Default for MockTransportBuilder {
    fn default() -> Self {
        Self {
            enumeration: true,
            leaky_observers: false,
            connect_delay: Duration::ZERO,
            services: vec![DEFAULT_SERVICE],
            characteristics: vec![DEFAULT_CHARACTERISTIC],
            granted: Vec::new(),
            selections: Vec::new(),
            enumerate_failure: None,
            subscribe_failure: None,
        }
    }
}

impl MockTransportBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether enumeration of granted peripherals is supported.
    #[must_use]
    pub fn enumeration(mut self, supported: bool) -> Self {
        self.enumeration = supported;
        self
    }

    /// Add a previously granted peripheral.
    #[must_use]
    pub fn granted(mut self, peripheral: PeripheralRef) -> Self {
        self.granted.push(peripheral);
        self
    }

    /// Queue an interactive selection result.
    #[must_use]
    pub fn selection(mut self, peripheral: PeripheralRef) -> Self {
        self.selections.push(Ok(peripheral));
        self
    }

    /// Queue an interactive selection failure.
    #[must_use]
    pub fn selection_failure(mut self, failure: MockFailure) -> Self {
        self.selections.push(Err(failure));
        self
    }

    /// Fail the first enumeration call.
    #[must_use]
    pub fn enumerate_failure(mut self, failure: MockFailure) -> Self {
        self.enumerate_failure = Some(failure);
        self
    }

    /// Fail every subscribe call with `detail`.
    #[must_use]
    pub fn fail_subscribe(mut self, detail: &str) -> Self {
        self.subscribe_failure = Some(detail.to_string());
        self
    }

    /// Services exposed by every peripheral.
    #[must_use]
    pub fn services(mut self, services: Vec<Uuid>) -> Self {
        self.services = services;
        self
    }

    /// Characteristics exposed by every service.
    #[must_use]
    pub fn characteristics(mut self, characteristics: Vec<Uuid>) -> Self {
        self.characteristics = characteristics;
        self
    }

    /// Delay every connect by `delay`.
    #[must_use]
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Keep observers registered after their guard is dropped.
    ///
    /// Simulates disconnect events that were already dispatched when the
    /// observer was replaced.
    #[must_use]
    pub fn leaky_observers(mut self) -> Self {
        self.leaky_observers = true;
        self
    }

    /// Build the mock transport.
    #[must_use]
    pub fn build(self) -> MockTransport {
        MockTransport {
            enumeration: self.enumeration,
            leaky_observers: self.leaky_observers,
            connect_delay: self.connect_delay,
            services: self.services,
            characteristics: self.characteristics,
            granted: Mutex::new(self.granted),
            selections: Mutex::new(self.selections.into()),
            enumerate_failure: Mutex::new(self.enumerate_failure),
            connect_failures: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            subscribe_failure: Mutex::new(self.subscribe_failure),
            listeners: Mutex::new(Vec::new()),
            notifying: Mutex::new(HashSet::new()),
            linked: Mutex::new(HashSet::new()),
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }
}

/// An in-memory [`DurableStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    writes: AtomicU32,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding one value.
    pub fn with_value(key: &str, value: &str) -> Self {
        let store = Self::default();
        lock(&store.values).insert(key.to_string(), value.to_string());
        store
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful and failed write attempts.
    pub fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read a value without going through the trait.
    pub fn peek(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Store("mock store is read-only".to_string()));
        }
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// A [`StatusSink`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
    statuses: Mutex<Vec<Status>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every appended log line, in order.
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }

    /// Every status update, in order.
    pub fn statuses(&self) -> Vec<Status> {
        lock(&self.statuses).clone()
    }

    /// Log lines containing `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        lock(&self.lines)
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }
}

impl StatusSink for RecordingSink {
    fn append(&self, message: &str) {
        lock(&self.lines).push(message.to_string());
    }

    fn set_status(&self, status: Status) {
        lock(&self.statuses).push(status);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
