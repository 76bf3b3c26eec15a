//! Notification subscription management.
//!
//! [`SubscriptionManager`] owns at most one active characteristic
//! subscription. Binding a new subscription first removes the listener of
//! the previous one, so a payload is never delivered to both a stale and a
//! fresh handler, even across rapid reconnect cycles.
//!
//! Listener removal does not depend on the transport honoring
//! `unsubscribe`: every listener handed to the transport is gated on its
//! handle's liveness flag, which is cleared synchronously.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::{CharacteristicHandle, PayloadCallback, Transport};

/// An active notification subscription.
///
/// Cloning produces another reference to the same subscription; once
/// unbound, every clone reports [`is_live`](Self::is_live) as `false`.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    characteristic: CharacteristicHandle,
    live: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    fn new(id: u64, characteristic: CharacteristicHandle) -> Self {
        Self {
            id,
            characteristic,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Manager-unique identifier of this subscription.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The subscribed characteristic.
    pub fn characteristic(&self) -> &CharacteristicHandle {
        &self.characteristic
    }

    /// Whether this subscription still delivers payloads.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Remove the listener. Returns `true` if it was live.
    fn kill(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    /// Wrap `on_payload` so it only fires while this handle is live.
    fn gate(&self, on_payload: PayloadCallback) -> PayloadCallback {
        let live = Arc::clone(&self.live);
        Arc::new(move |data: &[u8]| {
            if live.load(Ordering::SeqCst) {
                on_payload(data);
            }
        })
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("characteristic", &self.characteristic.to_string())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Owner of the single active notification subscription.
pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    active: Mutex<Option<SubscriptionHandle>>,
    next_id: AtomicU64,
}

impl SubscriptionManager {
    /// Create a manager issuing subscribe calls through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to `characteristic`, replacing any active subscription.
    ///
    /// The previous listener is removed before the new one is registered,
    /// and the new listener is registered before the transport's subscribe
    /// call is issued. On failure no subscription is active.
    pub async fn bind(
        &self,
        characteristic: CharacteristicHandle,
        on_payload: PayloadCallback,
    ) -> Result<SubscriptionHandle> {
        if let Some(previous) = self.take_active() {
            debug!(subscription = previous.id, "Replacing active subscription");
            self.retire(previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = SubscriptionHandle::new(id, characteristic);
        let listener = handle.gate(on_payload);
        self.set_active(handle.clone());

        if let Err(e) = self.transport.subscribe(&handle.characteristic, listener).await {
            self.release(&handle);
            return Err(e);
        }

        debug!(subscription = id, characteristic = %handle.characteristic, "Subscribed");
        Ok(handle)
    }

    /// Remove the listener and disable notifications on the transport.
    ///
    /// A transport failure while unsubscribing is logged, not returned: the
    /// listener is already gone, which is what callers rely on.
    pub async fn unbind(&self, handle: &SubscriptionHandle) {
        self.clear_if_active(handle);
        self.retire(handle.clone()).await;
    }

    /// Remove the listener without calling the transport.
    ///
    /// Used when the link is already gone. Returns `true` if the handle
    /// was live.
    pub fn release(&self, handle: &SubscriptionHandle) -> bool {
        self.clear_if_active(handle);
        handle.kill()
    }

    /// Release whatever subscription is active, if any.
    pub fn release_active(&self) -> bool {
        match self.take_active() {
            Some(handle) => handle.kill(),
            None => false,
        }
    }

    /// Unbind whatever subscription is active, if any.
    pub async fn unbind_active(&self) {
        if let Some(handle) = self.take_active() {
            self.retire(handle).await;
        }
    }

    /// The active subscription, if any.
    pub fn active(&self) -> Option<SubscriptionHandle> {
        self.lock().clone()
    }

    /// Whether a live subscription is bound.
    pub fn is_bound(&self) -> bool {
        self.lock().as_ref().is_some_and(SubscriptionHandle::is_live)
    }

    async fn retire(&self, handle: SubscriptionHandle) {
        if !handle.kill() {
            // Already released with the link; nothing to unsubscribe from.
            return;
        }
        if let Err(e) = self.transport.unsubscribe(&handle.characteristic).await {
            warn!(subscription = handle.id, "Unsubscribe failed: {}", e);
        }
    }

    fn take_active(&self) -> Option<SubscriptionHandle> {
        self.lock().take()
    }

    fn set_active(&self, handle: SubscriptionHandle) {
        *self.lock() = Some(handle);
    }

    fn clear_if_active(&self, handle: &SubscriptionHandle) {
        let mut active = self.lock();
        if active.as_ref().is_some_and(|h| h.id == handle.id) {
            *active = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<SubscriptionHandle>> {
        // A poisoned slot still holds a consistent Option.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::mock::MockTransport;
    use blelink_types::PeripheralRef;
    use blelink_types::uuid::{NUS_SERVICE, NUS_TX};

    fn characteristic(id: &str) -> CharacteristicHandle {
        CharacteristicHandle {
            peripheral: PeripheralRef::new(id),
            service: NUS_SERVICE,
            uuid: NUS_TX,
        }
    }

    fn counter() -> (Arc<AtomicU32>, PayloadCallback) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = Arc::clone(&count);
        let callback: PayloadCallback = Arc::new(move |_data: &[u8]| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[tokio::test]
    async fn test_bind_delivers_payloads() {
        let transport = Arc::new(MockTransport::new());
        let manager = SubscriptionManager::new(transport.clone());
        let (count, callback) = counter();

        let handle = manager.bind(characteristic("a"), callback).await.unwrap();
        assert!(handle.is_live());
        assert!(manager.is_bound());

        transport.emit_payload(&[1, 2, 3]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rebind_removes_previous_listener() {
        let transport = Arc::new(MockTransport::new());
        let manager = SubscriptionManager::new(transport.clone());
        let (stale, stale_cb) = counter();
        let (fresh, fresh_cb) = counter();

        let first = manager.bind(characteristic("a"), stale_cb).await.unwrap();
        let second = manager.bind(characteristic("a"), fresh_cb).await.unwrap();

        assert!(!first.is_live());
        assert!(second.is_live());
        assert_ne!(first.id(), second.id());
        assert_eq!(transport.unsubscribe_calls(), 1);

        transport.emit_payload(&[0xAA]);
        assert_eq!(stale.load(Ordering::SeqCst), 0);
        assert_eq!(fresh.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_leaves_nothing_bound() {
        let transport = Arc::new(MockTransport::builder().fail_subscribe("GATT write failed").build());
        let manager = SubscriptionManager::new(transport.clone());
        let (_count, callback) = counter();

        assert!(manager.bind(characteristic("a"), callback).await.is_err());
        assert!(!manager.is_bound());
        assert!(manager.active().is_none());
    }

    #[tokio::test]
    async fn test_release_skips_transport() {
        let transport = Arc::new(MockTransport::new());
        let manager = SubscriptionManager::new(transport.clone());
        let (count, callback) = counter();

        let handle = manager.bind(characteristic("a"), callback).await.unwrap();
        assert!(manager.release(&handle));
        assert!(!manager.release(&handle));
        assert_eq!(transport.unsubscribe_calls(), 0);

        // Unbinding a released handle must not call the transport either.
        manager.unbind(&handle).await;
        assert_eq!(transport.unsubscribe_calls(), 0);

        transport.emit_payload(&[1]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unbind_calls_transport_once() {
        let transport = Arc::new(MockTransport::new());
        let manager = SubscriptionManager::new(transport.clone());
        let (_count, callback) = counter();

        let handle = manager.bind(characteristic("a"), callback).await.unwrap();
        manager.unbind(&handle).await;
        manager.unbind(&handle).await;
        assert_eq!(transport.unsubscribe_calls(), 1);
        assert!(!manager.is_bound());
    }

    #[tokio::test]
    async fn test_unbind_stale_handle_keeps_active() {
        let transport = Arc::new(MockTransport::new());
        let manager = SubscriptionManager::new(transport.clone());
        let (_a, cb_a) = counter();
        let (_b, cb_b) = counter();

        let first = manager.bind(characteristic("a"), cb_a).await.unwrap();
        let second = manager.bind(characteristic("a"), cb_b).await.unwrap();

        manager.unbind(&first).await;
        assert_eq!(manager.active().map(|h| h.id()), Some(second.id()));
        assert!(manager.is_bound());
    }
}

/// Property-based tests for the single-listener invariant.
#[cfg(test)]
mod proptests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use proptest::prelude::*;

    use crate::mock::MockTransport;
    use blelink_types::PeripheralRef;
    use blelink_types::uuid::{NUS_SERVICE, NUS_TX};

    #[derive(Debug, Clone)]
    enum Op {
        Bind,
        UnbindActive,
        ReleaseActive,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Bind),
            1 => Just(Op::UnbindActive),
            1 => Just(Op::ReleaseActive),
        ]
    }

    proptest! {
        /// Any sequence of operations leaves at most one listener delivering.
        #[test]
        fn at_most_one_listener_delivers(ops in proptest::collection::vec(op(), 1..30)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let transport = Arc::new(MockTransport::new());
                let manager = SubscriptionManager::new(transport.clone());
                let deliveries = Arc::new(AtomicU32::new(0));

                for op in ops {
                    match op {
                        Op::Bind => {
                            let inner = Arc::clone(&deliveries);
                            let characteristic = CharacteristicHandle {
                                peripheral: PeripheralRef::new("p"),
                                service: NUS_SERVICE,
                                uuid: NUS_TX,
                            };
                            let callback: PayloadCallback = Arc::new(move |_: &[u8]| {
                                inner.fetch_add(1, Ordering::SeqCst);
                            });
                            manager.bind(characteristic, callback).await.unwrap();
                        }
                        Op::UnbindActive => manager.unbind_active().await,
                        Op::ReleaseActive => {
                            manager.release_active();
                        }
                    }

                    deliveries.store(0, Ordering::SeqCst);
                    transport.emit_payload(&[0x42]);
                    let delivered = deliveries.load(Ordering::SeqCst);
                    assert!(delivered <= 1, "payload delivered {} times", delivered);
                    assert_eq!(delivered == 1, manager.is_bound());
                }
            });
        }
    }
}
