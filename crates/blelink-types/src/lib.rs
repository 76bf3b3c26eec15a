//! Platform-agnostic types for persistent BLE peripheral sessions.
//!
//! This crate provides the data model shared by the connection manager
//! (blelink-core) and any front end that renders session state.
//!
//! # Features
//!
//! - Peripheral identity ([`PeripheralRef`]) with equality by identifier
//! - Session state machine states ([`SessionState`])
//! - Failure classification ([`FailureReason`]) and attempt outcomes ([`ConnectResult`])
//! - Default GATT identifiers for the notification profile
//!
//! # Example
//!
//! ```
//! use blelink_types::{ConnectResult, FailureReason, PeripheralRef, SessionState};
//!
//! let peripheral = PeripheralRef::with_name("abc123", "Sensor");
//! assert_eq!(peripheral, PeripheralRef::new("abc123"));
//!
//! let result = ConnectResult::Failed(FailureReason::PermissionOrSecurityDenied);
//! assert!(result.is_failed());
//! assert!(!SessionState::Failed.holds_peripheral());
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{TypesError, TypesResult};
pub use types::{ConnectResult, FailureReason, PeripheralRef, SessionState};
pub use uuid as uuids;
