//! Capability traits at the boundary of the connection manager.
//!
//! The core never touches a Bluetooth stack, a disk, or a screen directly.
//! It drives three injected capabilities:
//!
//! - [`Transport`]: selection, enumeration, GATT connect and notifications
//! - [`DurableStore`]: a string key-value store for the remembered peripheral
//! - [`StatusSink`]: fire-and-forget status and log output
//!
//! Real implementations live in [`crate::btle`] and the CLI; in-memory fakes
//! live in [`crate::mock`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use blelink_types::{PeripheralRef, SessionState};

use crate::config::SelectionFilter;
use crate::error::Result;
use crate::guard::Unregister;

/// Callback receiving raw notification payloads.
pub type PayloadCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked when the transport reports a link loss.
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// A linked GATT server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    /// The peripheral this server belongs to.
    pub peripheral: PeripheralRef,
}

/// A resolved primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// The peripheral this service belongs to.
    pub peripheral: PeripheralRef,
    /// Service UUID.
    pub uuid: Uuid,
}

/// A resolved characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// The peripheral this characteristic belongs to.
    pub peripheral: PeripheralRef,
    /// Owning service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.peripheral.id, self.service, self.uuid)
    }
}

/// GATT transport capability.
///
/// Every method may fail; the connection state machine classifies the
/// failure and never lets it escape. Implementations impose their own
/// timeouts; the core imposes none.
///
/// # Example
///
/// ```ignore
/// use blelink_core::{Transport, Result};
///
/// async fn list<T: Transport>(transport: &T) -> Result<()> {
///     if transport.supports_enumeration() {
///         for peripheral in transport.enumerate_granted().await? {
///             println!("{}", peripheral);
///         }
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    // --- Discovery ---

    /// Whether [`enumerate_granted`](Self::enumerate_granted) is available.
    ///
    /// This is a capability check and must not touch the radio.
    fn supports_enumeration(&self) -> bool;

    /// Ask the user to pick a peripheral. May be cancelled or refused.
    async fn request_interactive(&self, filter: &SelectionFilter) -> Result<PeripheralRef>;

    /// List peripherals this application was previously granted access to.
    async fn enumerate_granted(&self) -> Result<Vec<PeripheralRef>>;

    // --- GATT ---

    /// Establish the link-level connection.
    async fn connect(&self, peripheral: &PeripheralRef) -> Result<ServerHandle>;

    /// Resolve a primary service on a linked server.
    async fn resolve_service(&self, server: &ServerHandle, service: Uuid) -> Result<ServiceHandle>;

    /// Resolve a characteristic on a resolved service.
    async fn resolve_characteristic(
        &self,
        service: &ServiceHandle,
        characteristic: Uuid,
    ) -> Result<CharacteristicHandle>;

    /// Enable notifications and deliver each payload to `on_payload`.
    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
        on_payload: PayloadCallback,
    ) -> Result<()>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Drop the link voluntarily.
    ///
    /// The default implementation does nothing, for transports whose links
    /// close when the last handle goes away.
    async fn disconnect(&self, _peripheral: &PeripheralRef) -> Result<()> {
        Ok(())
    }

    // --- Events ---

    /// Register a link-loss observer for `peripheral`.
    ///
    /// The returned guard removes the observer when dropped.
    fn on_disconnect(&self, peripheral: &PeripheralRef, callback: DisconnectCallback) -> Unregister;
}

/// Persistent string key-value storage.
pub trait DurableStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Status shown to the user: either a session state or a free-form line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// A session state transition.
    State(SessionState),
    /// A descriptive status without a state change.
    Text(String),
}

impl From<SessionState> for Status {
    fn from(state: SessionState) -> Self {
        Status::State(state)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::State(state) => write!(f, "{}", state),
            Status::Text(text) => write!(f, "{}", text),
        }
    }
}

/// User-facing status and log output.
///
/// Calls are fire-and-forget: the core never waits on the sink and
/// implementations must not block.
pub trait StatusSink: Send + Sync {
    /// Append one human-readable log line.
    fn append(&self, message: &str);

    /// Replace the displayed status.
    fn set_status(&self, status: Status);
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl StatusSink for NullSink {
    fn append(&self, _message: &str) {}

    fn set_status(&self, _status: Status) {}
}
