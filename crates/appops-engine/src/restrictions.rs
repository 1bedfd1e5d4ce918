//! Restriction sets
//!
//! Clients install deny lists under their own [`RestrictionToken`]. A token
//! may restrict ops globally or per user, and per-user restrictions may
//! exclude packages (optionally narrowed to attribution tags). An op is
//! restricted when any token restricts it in a matching scope without
//! excluding the caller.

use appops_core::{AttributionTag, OpCode, PackageName, RestrictionToken, UserId};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Users a restriction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserScope {
    /// One user
    User(UserId),
    /// Every user, present and future
    AllUsers,
}

impl UserScope {
    fn key(self) -> Option<UserId> {
        match self {
            UserScope::User(user) => Some(user),
            UserScope::AllUsers => None,
        }
    }
}

/// Packages (and optionally tags) exempt from a restriction
///
/// A package listed with no tags is exempt for every tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageTagsList {
    entries: HashMap<PackageName, BTreeSet<AttributionTag>>,
}

impl PackageTagsList {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// List exempting whole packages
    pub fn from_packages<I, P>(packages: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PackageName>,
    {
        let mut list = Self::new();
        for package in packages {
            list.add_package(package);
        }
        list
    }

    /// Exempt every tag of `package`
    pub fn add_package(&mut self, package: impl Into<PackageName>) {
        self.entries.insert(package.into(), BTreeSet::new());
    }

    /// Exempt one tag of `package`
    ///
    /// Has no effect when the whole package is already exempt.
    pub fn add_tag(&mut self, package: impl Into<PackageName>, tag: impl Into<AttributionTag>) {
        let package = package.into();
        match self.entries.get_mut(&package) {
            Some(tags) if tags.is_empty() => {}
            Some(tags) => {
                tags.insert(tag.into());
            }
            None => {
                self.entries.insert(package, BTreeSet::from([tag.into()]));
            }
        }
    }

    /// Whether `package` is listed at all
    pub fn contains_package(&self, package: &str) -> bool {
        self.entries.contains_key(package)
    }

    /// Whether `package` is exempt for `tag`
    pub fn contains(&self, package: &str, tag: Option<&AttributionTag>) -> bool {
        match self.entries.get(package) {
            None => false,
            Some(tags) if tags.is_empty() => true,
            Some(tags) => tag.is_some_and(|tag| tags.contains(tag)),
        }
    }

    /// Whether nothing is listed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-user state of one token
#[derive(Debug, Clone, Default)]
struct UserRestriction {
    ops: HashSet<OpCode>,
    excluded: Option<PackageTagsList>,
}

impl UserRestriction {
    fn restricts(&self, op: OpCode, package: Option<&str>, tag: Option<&AttributionTag>, is_check: bool) -> bool {
        if !self.ops.contains(&op) {
            return false;
        }
        let (Some(excluded), Some(package)) = (&self.excluded, package) else {
            return true;
        };
        let exempt = if is_check {
            excluded.contains_package(package)
        } else {
            excluded.contains(package, tag)
        };
        !exempt
    }
}

/// Every installed restriction
#[derive(Debug, Default)]
pub struct RestrictionSets {
    global: HashMap<RestrictionToken, HashSet<OpCode>>,
    per_user: HashMap<RestrictionToken, HashMap<Option<UserId>, UserRestriction>>,
}

impl RestrictionSets {
    /// No restrictions
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict or lift `op` for every user under `token`; returns whether anything changed
    pub fn set_global(&mut self, token: RestrictionToken, op: OpCode, restricted: bool) -> bool {
        if restricted {
            return self.global.entry(token).or_default().insert(op);
        }
        let Some(ops) = self.global.get_mut(&token) else {
            return false;
        };
        let changed = ops.remove(&op);
        if ops.is_empty() {
            self.global.remove(&token);
        }
        changed
    }

    /// Restrict or lift `op` in `scope` under `token`
    ///
    /// When restricting, `excluded` replaces the scope's exclusion list.
    /// Returns whether the effective restriction changed.
    pub fn set_user(
        &mut self,
        token: RestrictionToken,
        op: OpCode,
        restricted: bool,
        excluded: Option<PackageTagsList>,
        scope: UserScope,
    ) -> bool {
        let key = scope.key();
        if restricted {
            let state = self
                .per_user
                .entry(token)
                .or_default()
                .entry(key)
                .or_default();
            let added = state.ops.insert(op);
            let excluded = excluded.filter(|list| !list.is_empty());
            let exclusions_changed = state.excluded != excluded;
            state.excluded = excluded;
            return added || exclusions_changed;
        }

        let Some(users) = self.per_user.get_mut(&token) else {
            return false;
        };
        let Some(state) = users.get_mut(&key) else {
            return false;
        };
        let changed = state.ops.remove(&op);
        if state.ops.is_empty() {
            users.remove(&key);
        }
        if users.is_empty() {
            self.per_user.remove(&token);
        }
        changed
    }

    /// Drop everything installed by `token`; returns the ops it restricted
    pub fn remove_token(&mut self, token: RestrictionToken) -> Vec<OpCode> {
        let mut ops: BTreeSet<OpCode> = BTreeSet::new();
        if let Some(global) = self.global.remove(&token) {
            ops.extend(global);
        }
        if let Some(users) = self.per_user.remove(&token) {
            ops.extend(users.into_values().flat_map(|state| state.ops));
        }
        ops.into_iter().collect()
    }

    /// Drop per-user restrictions scoped to `user`; returns the ops they restricted
    pub fn remove_user(&mut self, user: UserId) -> Vec<OpCode> {
        let mut ops: BTreeSet<OpCode> = BTreeSet::new();
        self.per_user.retain(|_, users| {
            if let Some(state) = users.remove(&Some(user)) {
                ops.extend(state.ops);
            }
            !users.is_empty()
        });
        ops.into_iter().collect()
    }

    /// Whether any token restricts `op` globally
    pub fn is_globally_restricted(&self, op: OpCode) -> bool {
        self.global.values().any(|ops| ops.contains(&op))
    }

    /// Whether a per-user restriction covers `op` for `package` of `user`
    ///
    /// Checks match exclusions by package only; note and start also require
    /// the exclusion to cover `tag`. Global restrictions are not consulted.
    pub fn is_user_restricted(
        &self,
        op: OpCode,
        user: UserId,
        package: Option<&str>,
        tag: Option<&AttributionTag>,
        is_check: bool,
    ) -> bool {
        self.per_user.values().any(|users| {
            [Some(user), None]
                .iter()
                .filter_map(|key| users.get(key))
                .any(|state| state.restricts(op, package, tag, is_check))
        })
    }

    /// Whether no restriction is installed
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.per_user.is_empty()
    }
}
