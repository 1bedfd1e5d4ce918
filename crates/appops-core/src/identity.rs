//! Caller and subject identities, and the package resolver collaborator.

use serde::{Deserialize, Serialize};

use crate::flags::{BypassFlags, Privileges};
use crate::ids::{AttributionTag, DeviceId, PackageName, Uid, UserId};

/// Facts about an installed package, as known to the package manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// Canonical package name
    pub name: PackageName,
    /// Owning uid
    pub uid: Uid,
    /// Restriction bypass classes the package belongs to
    pub bypass: BypassFlags,
    /// Attribution tags declared by the package
    pub attribution_tags: Vec<AttributionTag>,
}

impl PackageInfo {
    /// Package with no bypass classes and no declared tags
    pub fn new(uid: Uid, name: impl Into<PackageName>) -> Self {
        Self {
            name: name.into(),
            uid,
            bypass: BypassFlags::empty(),
            attribution_tags: Vec::new(),
        }
    }

    /// Set the bypass descriptor
    pub fn with_bypass(mut self, bypass: BypassFlags) -> Self {
        self.bypass = bypass;
        self
    }

    /// Declare an attribution tag
    pub fn with_tag(mut self, tag: impl Into<AttributionTag>) -> Self {
        self.attribution_tags.push(tag.into());
        self
    }
}

/// Package-manager lookups consumed by the engine.
///
/// Called outside the engine lock; implementations may block briefly but
/// should not call back into the engine.
pub trait PackageResolver: Send + Sync {
    /// Resolve a package claimed by `uid`; `None` if it does not exist or
    /// belongs to another uid
    fn resolve(&self, uid: Uid, package: &str) -> Option<PackageInfo>;

    /// Packages installed under `uid`
    fn packages_for_uid(&self, uid: Uid) -> Vec<PackageName>;

    /// Uid of `package` for `user`
    fn uid_for_package(&self, user: UserId, package: &str) -> Option<Uid>;

    /// Whether `device` names a known device
    fn is_device_known(&self, device: &DeviceId) -> bool {
        device.is_default()
    }
}

/// Package name of the fixed non-package system subjects.
///
/// The system uid only maps to a special package when the caller names no
/// package; system apps sharing that uid resolve normally.
pub fn special_package(uid: Uid, package: Option<&str>) -> Option<&'static str> {
    match uid {
        Uid::ROOT => Some("root"),
        Uid::SHELL => Some("shell"),
        Uid::MEDIA => Some("media"),
        Uid::AUDIOSERVER => Some("audioserver"),
        Uid::CAMERASERVER => Some("cameraserver"),
        Uid::SYSTEM if package.is_none() || package == Some("system") => Some("system"),
        _ => None,
    }
}

/// Subjects whose ops are allowed without consulting any state
pub fn is_always_allowed(uid: Uid) -> bool {
    uid == Uid::ROOT || uid == Uid::SYSTEM
}

/// The party invoking an engine verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerContext {
    /// Calling uid
    pub uid: Uid,
    /// Privileges held by the caller
    pub privileges: Privileges,
}

impl CallerContext {
    /// An unprivileged app
    pub fn app(uid: Uid) -> Self {
        Self {
            uid,
            privileges: Privileges::empty(),
        }
    }

    /// A caller with explicit privileges
    pub fn with_privileges(uid: Uid, privileges: Privileges) -> Self {
        Self { uid, privileges }
    }

    /// The system itself
    pub fn system() -> Self {
        Self {
            uid: Uid::SYSTEM,
            privileges: Privileges::all(),
        }
    }

    /// Whether the caller holds `privilege`; root and system hold everything
    pub fn has(&self, privilege: Privileges) -> bool {
        is_always_allowed(self.uid) || self.privileges.contains(privilege)
    }
}

/// One side of a proxied call; also recorded as proxy info on usage history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Uid of the party
    pub uid: Uid,
    /// Package of the party
    pub package: Option<PackageName>,
    /// Attribution tag within the package
    pub attribution_tag: Option<AttributionTag>,
    /// Device the party acts on
    #[serde(default)]
    pub device: DeviceId,
}

impl Identity {
    /// Identity on the default device with no tag
    pub fn new(uid: Uid, package: impl Into<PackageName>) -> Self {
        Self {
            uid,
            package: Some(package.into()),
            attribution_tag: None,
            device: DeviceId::default_device(),
        }
    }

    /// Attach an attribution tag
    pub fn with_tag(mut self, tag: impl Into<AttributionTag>) -> Self {
        self.attribution_tag = Some(tag.into());
        self
    }

    /// Target another device
    pub fn on_device(mut self, device: DeviceId) -> Self {
        self.device = device;
        self
    }
}
