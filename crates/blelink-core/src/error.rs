//! Error types for blelink-core.
//!
//! Transport and store adapters report failures as [`Error`]. The connection
//! state machine never lets these escape: every error raised during an
//! attempt is converted into a [`FailureReason`] with [`Error::classify`]
//! and returned inside a `ConnectResult`.
//!
//! # Classification
//!
//! | Error | Stage | Reason |
//! |-------|-------|--------|
//! | [`Error::Cancelled`] | any | `UserCancelledSelection` |
//! | [`Error::PermissionDenied`], btleplug `PermissionDenied` | any | `PermissionOrSecurityDenied` |
//! | [`Error::Unsupported`], btleplug `NotSupported` | any | `TransportUnavailable` |
//! | [`Error::DeviceNotFound`], [`Error::Timeout`], [`Error::NotConnected`] | any | `DeviceNotFound` |
//! | [`Error::ServiceNotFound`], [`Error::CharacteristicNotFound`] | any | `ProtocolNegotiationFailed` |
//! | anything else | [`Stage::Negotiation`], [`Stage::Subscribe`] | `ProtocolNegotiationFailed` |
//! | anything else | [`Stage::Selection`], [`Stage::Link`] | `Unknown(detail)` |

use std::time::Duration;

use blelink_types::FailureReason;
use thiserror::Error;

/// Errors that can occur while talking to a transport or durable store.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The user cancelled the interactive chooser.
    #[error("Operation cancelled")]
    Cancelled,

    /// The platform refused on permission or security grounds.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The platform lacks the requested capability.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// Peripheral not found during selection, enumeration, or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted without a link.
    #[error("Not connected to device")]
    NotConnected,

    /// The linked peripheral does not expose the expected service.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID that was not found.
        uuid: String,
    },

    /// The service does not expose the expected characteristic.
    #[error("Characteristic not found: {uuid} (in service {service})")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// The service that was searched.
        service: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Durable store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-specific failure without a better classification.
    #[error("{0}")]
    Other(String),
}

/// Reason why a peripheral was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// No matching peripherals in range.
    NoDevicesInRange,
    /// Peripheral with the given identifier is not known to the transport.
    NotFound { identifier: String },
    /// Scan finished before a match appeared.
    ScanTimeout { duration: Duration },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevicesInRange => write!(f, "no devices in range"),
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

/// Phase of a connection attempt in which an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Interactive selection or enumeration.
    Selection,
    /// Link-level connect.
    Link,
    /// Service and characteristic resolution.
    Negotiation,
    /// Enabling notifications.
    Subscribe,
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a service not found error.
    pub fn service_not_found(uuid: impl ToString) -> Self {
        Self::ServiceNotFound {
            uuid: uuid.to_string(),
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl ToString, service: impl ToString) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.to_string(),
            service: service.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Classify this error into a [`FailureReason`].
    ///
    /// The stage only matters for errors without an intrinsic meaning:
    /// once the link is up, an opaque failure is a negotiation failure.
    pub fn classify(&self, stage: Stage) -> FailureReason {
        match self {
            Error::Cancelled => FailureReason::UserCancelledSelection,
            Error::PermissionDenied(_) => FailureReason::PermissionOrSecurityDenied,
            Error::Unsupported(_) => FailureReason::TransportUnavailable,
            Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter) => {
                FailureReason::TransportUnavailable
            }
            Error::DeviceNotFound(_) | Error::Timeout { .. } | Error::NotConnected => {
                FailureReason::DeviceNotFound
            }
            Error::ServiceNotFound { .. } | Error::CharacteristicNotFound { .. } => {
                FailureReason::ProtocolNegotiationFailed
            }
            Error::Bluetooth(err) => classify_btleplug(err, stage),
            other => Self::by_stage(other.to_string(), stage),
        }
    }

    fn by_stage(detail: String, stage: Stage) -> FailureReason {
        match stage {
            Stage::Negotiation | Stage::Subscribe => FailureReason::ProtocolNegotiationFailed,
            Stage::Selection | Stage::Link => FailureReason::Unknown(detail),
        }
    }
}

fn classify_btleplug(err: &btleplug::Error, stage: Stage) -> FailureReason {
    use btleplug::Error as Ble;

    match err {
        Ble::PermissionDenied => FailureReason::PermissionOrSecurityDenied,
        Ble::NotSupported(_) => FailureReason::TransportUnavailable,
        Ble::DeviceNotFound | Ble::NotConnected | Ble::TimedOut(_) => FailureReason::DeviceNotFound,
        Ble::NoSuchCharacteristic | Ble::UnexpectedCharacteristic => {
            FailureReason::ProtocolNegotiationFailed
        }
        other => Error::by_stage(other.to_string(), stage),
    }
}

/// Result type alias using blelink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
