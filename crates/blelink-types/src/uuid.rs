//! Default GATT identifiers for the notification profile.
//!
//! These are configuration defaults, not protocol logic: front ends may
//! override every value through `LinkConfig` in blelink-core.

use uuid::{Uuid, uuid};

/// Nordic UART Service, the default service carrying notifications.
pub const NUS_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Nordic UART RX characteristic (central writes to peripheral).
pub const NUS_RX: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Nordic UART TX characteristic (peripheral notifies central).
pub const NUS_TX: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Default notifying characteristic.
pub const DEFAULT_CHARACTERISTIC: Uuid = NUS_TX;

/// Default service holding [`DEFAULT_CHARACTERISTIC`].
pub const DEFAULT_SERVICE: Uuid = NUS_SERVICE;

/// Default Durable Store key for the remembered peripheral identifier.
pub const DEFAULT_STORE_KEY: &str = "blelink.last_peripheral";

/// Default name-prefix filter for interactive selection (matches any name).
pub const DEFAULT_NAME_PREFIX: &str = "";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nus_uuids_share_base() {
        let suffix = "-b5a3-f393-e0a9-e50e24dcca9e";
        assert!(NUS_SERVICE.to_string().ends_with(suffix));
        assert!(NUS_RX.to_string().ends_with(suffix));
        assert!(NUS_TX.to_string().ends_with(suffix));
    }

    #[test]
    fn test_default_profile_is_nus_tx() {
        assert_eq!(DEFAULT_SERVICE, NUS_SERVICE);
        assert_eq!(DEFAULT_CHARACTERISTIC.to_string(), "6e400003-b5a3-f393-e0a9-e50e24dcca9e");
        assert_ne!(DEFAULT_CHARACTERISTIC, NUS_RX);
    }

    #[test]
    fn test_store_key_is_namespaced() {
        assert!(DEFAULT_STORE_KEY.starts_with("blelink."));
        assert!(DEFAULT_NAME_PREFIX.is_empty());
    }
}
