//! Mode resolution
//!
//! A pure function of the stored overrides, the restriction sets and the
//! uid's foreground state. Resolution order:
//!
//! 1. root and system are always allowed
//! 2. global restrictions on the requested op, then per-user ones unless
//!    the package and the op share a bypass class
//! 3. a uid-level override of the switch op that differs from its default
//! 4. the package-level override of the switch op, or the default
//!
//! Steps 3 and 4 run `Foreground` through foreground evaluation unless the
//! query is raw.

use appops_core::{
    is_always_allowed, AttributionTag, BypassFlags, DeviceId, Mode, ModeStore, OpCatalog, OpInfo,
    Uid,
};

use crate::restrictions::RestrictionSets;
use crate::uid_state::UidStateTracker;

/// Who is asking, as far as resolution cares
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    /// Uid performing the op
    pub uid: Uid,
    /// Package, when known
    pub package: Option<&'a str>,
    /// Validated attribution tag
    pub tag: Option<&'a AttributionTag>,
    /// Target device
    pub device: &'a DeviceId,
    /// Bypass descriptor of the package
    pub bypass: BypassFlags,
}

/// Outcome of resolving one op for one subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Effective decision
    pub mode: Mode,
    /// Decision ignoring restrictions
    pub policy_mode: Mode,
    /// Whether a restriction applied
    pub restricted: bool,
}

impl Resolution {
    fn always_allowed() -> Self {
        Self {
            mode: Mode::Allowed,
            policy_mode: Mode::Allowed,
            restricted: false,
        }
    }

    /// Whether an in-flight usage may keep running under this resolution
    pub fn permits_running(&self) -> bool {
        !self.restricted && matches!(self.policy_mode, Mode::Allowed | Mode::Default)
    }
}

/// Read-only view of the state resolution depends on
pub struct PolicyView<'a> {
    /// Op catalog
    pub catalog: &'a OpCatalog,
    /// Stored overrides
    pub modes: &'a dyn ModeStore,
    /// Installed restrictions
    pub restrictions: &'a RestrictionSets,
    /// Foreground state
    pub uid_states: &'a UidStateTracker,
    /// Current monotonic time
    pub now_elapsed_ms: u64,
}

impl PolicyView<'_> {
    /// Resolve `op` for `subject`
    ///
    /// `is_check` selects package-only exclusion matching; `raw` skips
    /// foreground evaluation.
    pub fn resolve(&self, op: &OpInfo, subject: &Subject<'_>, is_check: bool, raw: bool) -> Resolution {
        if is_always_allowed(subject.uid) {
            return Resolution::always_allowed();
        }

        // Bypass applies to per-user restrictions only.
        let restricted = self.restrictions.is_globally_restricted(op.code)
            || (self.restrictions.is_user_restricted(
                op.code,
                subject.uid.user_id(),
                subject.package,
                subject.tag,
                is_check,
            ) && !subject.bypass.intersects(op.bypass));

        let stored = self.stored_mode(op, subject);
        let policy_mode = if raw {
            stored
        } else {
            self.uid_states.evaluate_mode(
                subject.uid,
                stored,
                op.foreground_capability,
                self.now_elapsed_ms,
            )
        };

        Resolution {
            mode: if restricted { Mode::Ignored } else { policy_mode },
            policy_mode,
            restricted,
        }
    }

    /// Stored mode before foreground evaluation
    pub fn stored_mode(&self, op: &OpInfo, subject: &Subject<'_>) -> Mode {
        let switch = op.switch;
        let default_mode = self.catalog.default_mode(switch).unwrap_or(op.default_mode);

        if let Some(mode) = self.modes.uid_mode(subject.uid, subject.device, switch) {
            if mode != default_mode {
                return mode;
            }
        }

        subject
            .package
            .and_then(|package| self.modes.package_mode(subject.uid.user_id(), package, switch))
            .unwrap_or(default_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::MapModeStore;
    use crate::restrictions::UserScope;
    use appops_core::{
        EngineConfig, OpCode, PackageName, ProcessCapabilities, RestrictionToken, UidState,
    };

    const CAMERA: OpCode = OpCode(26);
    const COARSE: OpCode = OpCode(0);
    const FINE: OpCode = OpCode(1);

    fn catalog() -> OpCatalog {
        OpCatalog::builder()
            .op(OpInfo::new(COARSE, "COARSE_LOCATION", Mode::Allowed)
                .with_foreground_capability(ProcessCapabilities::LOCATION))
            .op(OpInfo::new(FINE, "FINE_LOCATION", Mode::Allowed).with_switch(COARSE))
            .op(OpInfo::new(CAMERA, "CAMERA", Mode::Errored).with_bypass(BypassFlags::PRIVILEGED))
            .build()
            .unwrap()
    }

    struct Fixture {
        catalog: OpCatalog,
        modes: MapModeStore,
        restrictions: RestrictionSets,
        uid_states: UidStateTracker,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                catalog: catalog(),
                modes: MapModeStore::new(),
                restrictions: RestrictionSets::new(),
                uid_states: UidStateTracker::new(&EngineConfig::default()),
            }
        }

        fn resolve(&self, op: OpCode, package: &str, bypass: BypassFlags, raw: bool) -> Resolution {
            let device = DeviceId::default_device();
            let view = PolicyView {
                catalog: &self.catalog,
                modes: &self.modes,
                restrictions: &self.restrictions,
                uid_states: &self.uid_states,
                now_elapsed_ms: 0,
            };
            let subject = Subject {
                uid: Uid(10100),
                package: Some(package),
                tag: None,
                device: &device,
                bypass,
            };
            view.resolve(self.catalog.get(op).unwrap(), &subject, true, raw)
        }
    }

    #[test]
    fn test_default_mode_without_overrides() {
        let fixture = Fixture::new();
        assert_eq!(fixture.resolve(CAMERA, "cam.app", BypassFlags::empty(), false).mode, Mode::Errored);
    }

    #[test]
    fn test_uid_override_dominates_package_override() {
        let mut fixture = Fixture::new();
        let device = DeviceId::default_device();
        fixture
            .modes
            .set_package_mode(Uid(10100).user_id(), &PackageName::new("cam.app"), CAMERA, Some(Mode::Allowed));
        assert_eq!(fixture.resolve(CAMERA, "cam.app", BypassFlags::empty(), false).mode, Mode::Allowed);

        fixture.modes.set_uid_mode(Uid(10100), &device, CAMERA, Some(Mode::Ignored));
        assert_eq!(fixture.resolve(CAMERA, "cam.app", BypassFlags::empty(), false).mode, Mode::Ignored);

        // A uid override equal to the default defers to the package layer.
        fixture.modes.set_uid_mode(Uid(10100), &device, CAMERA, Some(Mode::Errored));
        assert_eq!(fixture.resolve(CAMERA, "cam.app", BypassFlags::empty(), false).mode, Mode::Allowed);
    }

    #[test]
    fn test_switch_op_governs_member() {
        let mut fixture = Fixture::new();
        fixture
            .modes
            .set_package_mode(Uid(10100).user_id(), &PackageName::new("maps.app"), COARSE, Some(Mode::Foreground));
        let raw = fixture.resolve(FINE, "maps.app", BypassFlags::empty(), true);
        assert_eq!(raw.mode, Mode::Foreground);

        assert_eq!(fixture.resolve(FINE, "maps.app", BypassFlags::empty(), false).mode, Mode::Ignored);
        fixture
            .uid_states
            .update(Uid(10100), UidState::Top, ProcessCapabilities::empty(), 0);
        assert_eq!(fixture.resolve(FINE, "maps.app", BypassFlags::empty(), false).mode, Mode::Allowed);
    }

    #[test]
    fn test_bypass_requires_shared_class() {
        let mut fixture = Fixture::new();
        fixture
            .modes
            .set_package_mode(Uid(10100).user_id(), &PackageName::new("cam.app"), CAMERA, Some(Mode::Allowed));
        fixture.restrictions.set_user(
            RestrictionToken(1),
            CAMERA,
            true,
            None,
            UserScope::AllUsers,
        );

        let denied = fixture.resolve(CAMERA, "cam.app", BypassFlags::EXEMPT, false);
        assert_eq!(denied.mode, Mode::Ignored);
        assert!(denied.restricted);
        assert_eq!(denied.policy_mode, Mode::Allowed);

        let bypassed = fixture.resolve(CAMERA, "cam.app", BypassFlags::PRIVILEGED, false);
        assert_eq!(bypassed.mode, Mode::Allowed);
        assert!(!bypassed.restricted);
    }

    #[test]
    fn test_global_restriction_is_never_bypassed() {
        let mut fixture = Fixture::new();
        fixture
            .modes
            .set_package_mode(Uid(10100).user_id(), &PackageName::new("cam.app"), CAMERA, Some(Mode::Allowed));
        fixture.restrictions.set_global(RestrictionToken(1), CAMERA, true);

        let restricted = fixture.resolve(CAMERA, "cam.app", BypassFlags::PRIVILEGED, false);
        assert_eq!(restricted.mode, Mode::Ignored);
        assert!(restricted.restricted);
    }
}
