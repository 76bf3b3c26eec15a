//! Core types for peripheral sessions.

use core::fmt;
use core::hash::{Hash, Hasher};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};

/// Handle to a specific physical peripheral as known to the transport.
///
/// Carries a stable identifier and an optional human-readable name.
/// Equality and hashing use the identifier only, so a peripheral
/// re-discovered under a different advertised name is still the same one.
///
/// Instances are immutable once created. Transports create them on
/// interactive selection or enumeration.
#[derive(Debug, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeripheralRef {
    /// Stable transport-level identifier (MAC address or platform UUID).
    pub id: String,
    /// Advertised name, if known.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub name: Option<String>,
}

impl PeripheralRef {
    /// Create a reference without a name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a reference with an advertised name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// Create a reference from untrusted input, rejecting blank identifiers.
    ///
    /// # Examples
    ///
    /// ```
    /// use blelink_types::{PeripheralRef, TypesError};
    ///
    /// assert!(PeripheralRef::parse("AA:BB:CC:DD:EE:FF").is_ok());
    /// assert_eq!(PeripheralRef::parse("  "), Err(TypesError::EmptyIdentifier));
    /// ```
    pub fn parse(id: &str) -> TypesResult<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(TypesError::EmptyIdentifier);
        }
        Ok(Self::new(trimmed))
    }

    /// Name if advertised, otherwise the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl PartialEq for PeripheralRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for PeripheralRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeripheralRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// State of the logical session with the peripheral.
///
/// A peripheral is "current" only in [`Connecting`](Self::Connecting),
/// [`Connected`](Self::Connected) and
/// [`WaitingForUserGesture`](Self::WaitingForUserGesture).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionState {
    /// No session and no current peripheral.
    #[default]
    Disconnected,
    /// Waiting on the interactive device chooser.
    RequestingSelection,
    /// A connection attempt is in flight.
    Connecting,
    /// Linked and receiving notifications.
    Connected,
    /// The platform needs a fresh user action before it will connect.
    WaitingForUserGesture,
    /// The last attempt failed.
    Failed,
}

impl SessionState {
    /// Whether a current peripheral may be held in this state.
    #[must_use]
    pub fn holds_peripheral(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::WaitingForUserGesture
        )
    }

    /// Whether the state represents an error condition.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(self, SessionState::Failed)
    }

    /// Short human-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::RequestingSelection => "Selecting device",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::WaitingForUserGesture => "Waiting for user action",
            SessionState::Failed => "Failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of a failed connection attempt.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "detail", rename_all = "snake_case"))]
#[non_exhaustive]
pub enum FailureReason {
    /// The user dismissed the device chooser. Never retried automatically.
    UserCancelledSelection,
    /// The platform refused on permission or security grounds.
    PermissionOrSecurityDenied,
    /// The platform lacks the required capability entirely.
    TransportUnavailable,
    /// The peripheral could not be reached or discovered.
    DeviceNotFound,
    /// Linked, but the expected service or characteristic was unusable.
    ProtocolNegotiationFailed,
    /// Anything else, with the raw detail preserved.
    Unknown(String),
}

/// Phrases that platforms use when an operation needs a fresh user action.
const GESTURE_HINTS: [&str; 4] = [
    "gesture",
    "user activation",
    "user interaction",
    "requires activation",
];

impl FailureReason {
    /// Best-effort check for "needs a fresh user gesture".
    ///
    /// A security denial always qualifies. An [`Unknown`](Self::Unknown)
    /// detail qualifies only if it mentions a gesture or activation.
    /// Platforms without a reliable signal fall on the non-gesture path.
    ///
    /// # Examples
    ///
    /// ```
    /// use blelink_types::FailureReason;
    ///
    /// assert!(FailureReason::PermissionOrSecurityDenied.requires_user_gesture());
    /// assert!(FailureReason::Unknown("Must be handling a user gesture".into()).requires_user_gesture());
    /// assert!(!FailureReason::DeviceNotFound.requires_user_gesture());
    /// ```
    #[must_use]
    pub fn requires_user_gesture(&self) -> bool {
        match self {
            FailureReason::PermissionOrSecurityDenied => true,
            FailureReason::Unknown(detail) => {
                let detail = detail.to_lowercase();
                GESTURE_HINTS.iter().any(|hint| detail.contains(hint))
            }
            _ => false,
        }
    }

    /// Whether the reason ends the current policy run outright.
    ///
    /// Cancellation is the user's decision and negotiation failures would
    /// repeat identically against the same peripheral.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FailureReason::UserCancelledSelection | FailureReason::ProtocolNegotiationFailed
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UserCancelledSelection => write!(f, "selection cancelled by user"),
            FailureReason::PermissionOrSecurityDenied => write!(f, "permission or security denied"),
            FailureReason::TransportUnavailable => write!(f, "Bluetooth transport unavailable"),
            FailureReason::DeviceNotFound => write!(f, "device not found"),
            FailureReason::ProtocolNegotiationFailed => {
                write!(f, "service or characteristic unavailable")
            }
            FailureReason::Unknown(detail) => write!(f, "{}", detail),
        }
    }
}

/// Outcome of a single connection attempt.
///
/// Failures are values, never panics or propagated errors, so the policy
/// layer can branch on them.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "result", content = "reason", rename_all = "snake_case"))]
pub enum ConnectResult {
    /// The session is connected and notifying.
    Ok,
    /// The attempt failed for the given reason.
    Failed(FailureReason),
}

impl ConnectResult {
    /// Whether the attempt succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectResult::Ok)
    }

    /// Whether the attempt failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        !self.is_ok()
    }

    /// The failure reason, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            ConnectResult::Ok => None,
            ConnectResult::Failed(reason) => Some(reason),
        }
    }
}

impl fmt::Display for ConnectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectResult::Ok => write!(f, "connected"),
            ConnectResult::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
