//! Link profile configuration.
//!
//! The GATT identifiers, the selection filter and the store key are
//! configuration constants at the boundary, not protocol logic. They default
//! to the values in [`blelink_types::uuid`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use blelink_types::uuid::{
    DEFAULT_CHARACTERISTIC, DEFAULT_NAME_PREFIX, DEFAULT_SERVICE, DEFAULT_STORE_KEY,
};

/// Default duration of the scan backing interactive selection.
const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(5);

/// Default timeout for link-level connection, enforced by the transport.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration of the peripheral profile and transport behavior.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blelink_core::LinkConfig;
///
/// let config = LinkConfig::default()
///     .name_prefix("Tag-")
///     .scan_duration(Duration::from_secs(8));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Service holding the notifying characteristic.
    pub service: Uuid,
    /// Characteristic whose notifications are delivered to the payload handler.
    pub characteristic: Uuid,
    /// Only peripherals whose advertised name starts with this are offered.
    pub name_prefix: String,
    /// Durable Store key for the remembered peripheral identifier.
    pub store_key: String,
    /// Scan duration backing interactive selection.
    #[serde(with = "duration_secs")]
    pub scan_duration: Duration,
    /// Link-level connection timeout.
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE,
            characteristic: DEFAULT_CHARACTERISTIC,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            store_key: DEFAULT_STORE_KEY.to_string(),
            scan_duration: DEFAULT_SCAN_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service UUID.
    #[must_use]
    pub fn service(mut self, service: Uuid) -> Self {
        self.service = service;
        self
    }

    /// Set the notifying characteristic UUID.
    #[must_use]
    pub fn characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = characteristic;
        self
    }

    /// Set the name-prefix filter.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the Durable Store key.
    #[must_use]
    pub fn store_key(mut self, key: impl Into<String>) -> Self {
        self.store_key = key.into();
        self
    }

    /// Set the interactive scan duration.
    #[must_use]
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The filter handed to interactive selection.
    pub fn selection_filter(&self) -> SelectionFilter {
        SelectionFilter {
            name_prefix: self.name_prefix.clone(),
            services: vec![self.service],
        }
    }

    /// Validate the config and return an error if invalid.
    ///
    /// Checks that:
    /// - `store_key` is not blank
    /// - `service` and `characteristic` are not nil
    /// - `scan_duration` and `connect_timeout` are > 0
    pub fn validate(&self) -> Result<()> {
        if self.store_key.trim().is_empty() {
            return Err(Error::invalid_config("store_key must not be empty"));
        }
        if self.service.is_nil() {
            return Err(Error::invalid_config("service UUID must not be nil"));
        }
        if self.characteristic.is_nil() {
            return Err(Error::invalid_config("characteristic UUID must not be nil"));
        }
        if self.scan_duration.is_zero() {
            return Err(Error::invalid_config("scan_duration must be > 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Filter passed to the transport's interactive chooser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionFilter {
    /// Required advertised-name prefix (empty matches everything).
    pub name_prefix: String,
    /// Services a candidate should advertise. Peripherals that advertise
    /// no services at all are still offered, since many omit them.
    pub services: Vec<Uuid>,
}

impl SelectionFilter {
    /// Whether an advertised name passes the prefix filter.
    pub fn matches_name(&self, name: Option<&str>) -> bool {
        if self.name_prefix.is_empty() {
            return true;
        }
        name.is_some_and(|n| n.starts_with(&self.name_prefix))
    }

    /// Whether an advertised service list passes the service filter.
    pub fn matches_services(&self, advertised: &[Uuid]) -> bool {
        self.services.is_empty()
            || advertised.is_empty()
            || advertised.iter().any(|uuid| self.services.contains(uuid))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
