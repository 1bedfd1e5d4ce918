//! Identifiers used throughout the engine
//!
//! String identities (packages, attribution tags, devices) are reference
//! counted so records, events and notifications can share them cheaply.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Number of uids reserved per user.
pub const PER_USER_RANGE: u32 = 100_000;

/// Persistent id of the device every request targets unless told otherwise.
pub const DEFAULT_DEVICE: &str = "default:0";

/// An OS principal; owns zero or more packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

impl Uid {
    /// Superuser
    pub const ROOT: Self = Self(0);
    /// Core system process
    pub const SYSTEM: Self = Self(1000);
    /// Media server
    pub const MEDIA: Self = Self(1013);
    /// Audio server
    pub const AUDIOSERVER: Self = Self(1041);
    /// Camera server
    pub const CAMERASERVER: Self = Self(1047);
    /// Debug shell
    pub const SHELL: Self = Self(2000);

    /// Compose a uid from a user and an app id
    pub fn of(user: UserId, app_id: u32) -> Self {
        Self(user.0 * PER_USER_RANGE + app_id % PER_USER_RANGE)
    }

    /// User owning this uid
    pub fn user_id(self) -> UserId {
        UserId(self.0 / PER_USER_RANGE)
    }

    /// Per-user app id
    pub fn app_id(self) -> u32 {
        self.0 % PER_USER_RANGE
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user (profile) partitioning the uid space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u32);

impl UserId {
    /// The primary user
    pub const SYSTEM: Self = Self(0);
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! shared_str_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create from any string
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(Arc::from(value.as_ref()))
            }

            /// Borrow the underlying string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

shared_str_id!(
    /// Installed application identity under a uid.
    PackageName
);

shared_str_id!(
    /// Package-declared sub-component label scoping usage records.
    AttributionTag
);

shared_str_id!(
    /// Stable identifier of the physical or virtual device an op targets.
    DeviceId
);

impl DeviceId {
    /// The default (physical) device
    pub fn default_device() -> Self {
        Self::new(DEFAULT_DEVICE)
    }

    /// Whether this is the default device
    pub fn is_default(&self) -> bool {
        self.as_str() == DEFAULT_DEVICE
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::default_device()
    }
}

/// Numeric code of a capability ("op") in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpCode(pub u16);

impl OpCode {
    /// Index into dense per-op tables
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

numeric_id!(
    /// Client token identifying one in-flight usage (start/finish pair).
    ClientToken
);

numeric_id!(
    /// Id shared by linked in-flight events across a proxy delegation.
    ChainId
);

numeric_id!(
    /// Handle of a watcher registration.
    ListenerId
);

numeric_id!(
    /// Client connection owning watcher registrations.
    ConnectionId
);

numeric_id!(
    /// Client token owning a restriction set.
    RestrictionToken
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_uid_user_split() {
        let uid = Uid(10_100_123);
        assert_eq!(uid.user_id(), UserId(101));
        assert_eq!(uid.app_id(), 123);
        assert_eq!(Uid::of(UserId(101), 123), uid);
        assert_eq!(Uid(10100).user_id(), UserId::SYSTEM);
    }

    #[test]
    fn test_package_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(PackageName::new("cam.app"), 1);
        assert_eq!(map.get("cam.app"), Some(&1));
    }

    #[test]
    fn test_default_device() {
        assert!(DeviceId::default().is_default());
        assert!(!DeviceId::new("virtual:7").is_default());
    }

    mod properties {
        use crate::ids::{Uid, UserId, PER_USER_RANGE};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn uid_splits_into_user_and_app_id(raw in any::<u32>()) {
                let uid = Uid(raw);
                prop_assert!(uid.app_id() < PER_USER_RANGE);
                prop_assert_eq!(Uid::of(uid.user_id(), uid.app_id()), uid);
            }

            #[test]
            fn composed_uid_keeps_its_user(user in 0u32..42_000, app_id in any::<u32>()) {
                let uid = Uid::of(UserId(user), app_id);
                prop_assert_eq!(uid.user_id(), UserId(user));
                prop_assert_eq!(uid.app_id(), app_id % PER_USER_RANGE);
            }
        }
    }
}
