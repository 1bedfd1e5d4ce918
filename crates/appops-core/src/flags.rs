//! Bit flag sets carried by requests, records and registrations.

use bitflags::bitflags;

bitflags! {
    /// How an access was performed, relative to proxying.
    ///
    /// Usage history is keyed by these flags so that self accesses and
    /// accesses on behalf of another app are reported separately.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct OpFlags: u32 {
        /// The app accessed the op for itself
        const SELF = 1 << 0;
        /// A trusted app accessed the op on behalf of another
        const TRUSTED_PROXY = 1 << 1;
        /// An untrusted app accessed the op on behalf of another
        const UNTRUSTED_PROXY = 1 << 2;
        /// The app was accessed through a trusted proxy
        const TRUSTED_PROXIED = 1 << 3;
        /// The app was accessed through an untrusted proxy
        const UNTRUSTED_PROXIED = 1 << 4;
    }
}

bitflags! {
    /// Role of an in-flight event within an attribution chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttributionFlags: u32 {
        /// First link of the chain, the app that accessed data
        const ACCESSOR = 1 << 0;
        /// Link between accessor and receiver
        const INTERMEDIARY = 1 << 1;
        /// Last link of the chain, the app that received data
        const RECEIVER = 1 << 2;
        /// The chain was vouched for by a trusted proxy
        const TRUSTED = 1 << 3;
    }
}

bitflags! {
    /// Restriction bypass classes.
    ///
    /// Packages carry a descriptor; ops declare which classes may bypass
    /// their restrictions. Bypass applies only on intersection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BypassFlags: u32 {
        /// Runs as the system uid
        const SYSTEM_UID = 1 << 0;
        /// Privileged system app
        const PRIVILEGED = 1 << 1;
        /// Explicitly exempted (e.g. emergency audio capture)
        const EXEMPT = 1 << 2;
    }
}

bitflags! {
    /// While-in-use capabilities a process may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProcessCapabilities: u32 {
        /// Foreground location access
        const LOCATION = 1 << 0;
        /// Foreground camera access
        const CAMERA = 1 << 1;
        /// Foreground microphone access
        const MICROPHONE = 1 << 2;
    }
}

bitflags! {
    /// Options of a mode watcher registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u32 {
        /// Also notify when the foreground evaluation of a `Foreground` mode flips
        const FOREGROUND_CHANGES = 1 << 0;
    }
}

bitflags! {
    /// Privileges held by a caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Privileges: u32 {
        /// Change uid and package modes
        const MANAGE_MODES = 1 << 0;
        /// Note and start ops on behalf of other uids; trusted proxying
        const UPDATE_STATS = 1 << 1;
        /// Read op state of other uids
        const GET_STATS = 1 << 2;
        /// Install and lift restrictions
        const MANAGE_RESTRICTIONS = 1 << 3;
    }
}

impl OpFlags {
    /// Flags of an access noted for the proxy side of a proxied call
    pub fn proxy(trusted: bool) -> Self {
        if trusted {
            Self::TRUSTED_PROXY
        } else {
            Self::UNTRUSTED_PROXY
        }
    }

    /// Flags of an access noted for the proxied side of a proxied call
    pub fn proxied(trusted: bool) -> Self {
        if trusted {
            Self::TRUSTED_PROXIED
        } else {
            Self::UNTRUSTED_PROXIED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bypass_intersection() {
        let app = BypassFlags::PRIVILEGED;
        let op = BypassFlags::SYSTEM_UID | BypassFlags::EXEMPT;
        assert!(!app.intersects(op));
        assert!(app.intersects(op | BypassFlags::PRIVILEGED));
    }

    #[test]
    fn test_proxy_flag_helpers() {
        assert_eq!(OpFlags::proxy(true), OpFlags::TRUSTED_PROXY);
        assert_eq!(OpFlags::proxied(false), OpFlags::UNTRUSTED_PROXIED);
    }
}
