//! Persistent BLE peripheral sessions with escalating reconnection.
//!
//! This crate keeps a stable logical session with a single GATT peripheral
//! even though the radio link underneath comes and goes. It remembers the
//! selected peripheral across restarts, reconnects through strategies
//! ordered from least to most intrusive, and keeps exactly one notification
//! subscription alive across reconnects.
//!
//! # Features
//!
//! - **Connection state machine**: generation-guarded attempts that return
//!   classified failures instead of errors ([`ConnectionStateMachine`])
//! - **Single subscription**: rebinding removes the stale listener first
//!   ([`SubscriptionManager`])
//! - **Reconnection policy**: in-memory retry, silent re-acquisition of the
//!   remembered peripheral, then interactive selection ([`ReconnectionPolicy`])
//! - **Supervised reconnection**: backoff-driven restoration after link loss
//!   ([`Supervisor`])
//! - **btleplug transport**: scan-backed selection and adapter-driven
//!   disconnect events ([`btle::BtleTransport`])
//! - **Test doubles**: call-counting transport, store and sink ([`mock`])
//!
//! # Capabilities
//!
//! The core drives three injected capabilities and never touches a
//! Bluetooth stack, a disk, or a screen directly:
//!
//! | Capability | Trait | Provided here |
//! |------------|-------|---------------|
//! | Radio | [`Transport`] | [`btle::BtleTransport`], [`mock::MockTransport`] |
//! | Persistence | [`DurableStore`] | [`mock::MemoryStore`] |
//! | Status and log | [`StatusSink`] | [`EventDispatcher`], [`NullSink`], [`mock::RecordingSink`] |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use blelink_core::btle::{BtleTransport, StrongestSignal};
//! use blelink_core::mock::MemoryStore;
//! use blelink_core::{ConnectionStateMachine, EventDispatcher, LinkConfig, ReconnectionPolicy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LinkConfig::default();
//!     let transport = Arc::new(BtleTransport::new(config.clone(), Arc::new(StrongestSignal)).await?);
//!     let events = Arc::new(EventDispatcher::default());
//!
//!     let machine = Arc::new(ConnectionStateMachine::new(
//!         transport.clone(),
//!         events.clone(),
//!         config,
//!         events.payload_callback(),
//!     ));
//!     let policy = ReconnectionPolicy::new(
//!         machine,
//!         transport,
//!         Arc::new(MemoryStore::new()),
//!         events,
//!     );
//!
//!     policy.connect_on_startup().await;
//!     policy.connect().await;
//!     Ok(())
//! }
//! ```

pub mod btle;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod mock;
pub mod policy;
pub mod reconnect;
pub mod session;
pub mod subscription;
pub mod traits;

// Re-export types and uuid modules from blelink-types
pub use blelink_types::types;
pub use blelink_types::uuid;

// Core exports
pub use config::{LinkConfig, SelectionFilter};
pub use error::{DeviceNotFoundReason, Error, Result, Stage};
pub use events::{EventDispatcher, EventReceiver, EventSender, SessionEvent};
pub use guard::Unregister;
pub use policy::{ReconnectionPolicy, RunMode, RunReport, Tier, TierOutcome};
pub use reconnect::{ReconnectOptions, RestoreOutcome, Supervisor};
pub use session::{ConnectOptions, ConnectionStateMachine};
pub use subscription::{SubscriptionHandle, SubscriptionManager};
pub use traits::{
    CharacteristicHandle, DisconnectCallback, DurableStore, NullSink, PayloadCallback,
    ServerHandle, ServiceHandle, Status, StatusSink, Transport,
};

// Re-export from blelink-types
pub use blelink_types::uuid as uuids;
pub use blelink_types::{ConnectResult, FailureReason, PeripheralRef, SessionState};
