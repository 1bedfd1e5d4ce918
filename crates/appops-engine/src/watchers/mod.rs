//! Watcher registrations
//!
//! One [`WatcherTable`] per listener kind. Registrations are bucketed by op
//! filter and owned by a client connection; closing the connection drops
//! them all. Registering the same listener object again on the same
//! connection reuses its id and adds the new op bucket.

pub mod dispatch;

pub use dispatch::{Notification, NotificationDispatcher, NotificationQueue};

use appops_core::{
    ActiveWatcher, ConnectionId, ListenerId, ModeWatcher, NotedWatcher, OpCode, StartedWatcher,
    Uid, WatchFlags,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Ops a registration listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpFilter {
    /// Every op
    All,
    /// One op
    Op(OpCode),
}

struct Registration<W: ?Sized> {
    listener: Arc<W>,
    connection: ConnectionId,
    uid: Option<Uid>,
    flags: WatchFlags,
    filters: BTreeSet<OpFilter>,
}

/// A listener selected for delivery
pub struct Matched<W: ?Sized> {
    /// Registration id
    pub id: ListenerId,
    /// Listener object
    pub listener: Arc<W>,
    /// Registration flags
    pub flags: WatchFlags,
    /// Whether it matched through the all-ops bucket only
    pub via_all: bool,
}

/// Registrations of one listener kind
pub struct WatcherTable<W: ?Sized> {
    registrations: BTreeMap<ListenerId, Registration<W>>,
    by_op: HashMap<OpFilter, BTreeSet<ListenerId>>,
}

impl<W: ?Sized> Default for WatcherTable<W> {
    fn default() -> Self {
        Self {
            registrations: BTreeMap::new(),
            by_op: HashMap::new(),
        }
    }
}

impl<W: ?Sized> std::fmt::Debug for WatcherTable<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherTable")
            .field("registrations", &self.registrations.len())
            .field("buckets", &self.by_op.len())
            .finish()
    }
}

fn same_listener<W: ?Sized>(a: &Arc<W>, b: &Arc<W>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

impl<W: ?Sized> WatcherTable<W> {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener` to the `filter` bucket
    ///
    /// A listener already registered on `connection` keeps its id, uid filter
    /// and flags; only the bucket is added.
    pub fn register(
        &mut self,
        next_id: ListenerId,
        connection: ConnectionId,
        listener: Arc<W>,
        filter: OpFilter,
        uid: Option<Uid>,
        flags: WatchFlags,
    ) -> ListenerId {
        let existing = self.registrations.iter_mut().find(|(_, registration)| {
            registration.connection == connection && same_listener(&registration.listener, &listener)
        });
        let id = match existing {
            Some((id, registration)) => {
                registration.filters.insert(filter);
                *id
            }
            None => {
                self.registrations.insert(
                    next_id,
                    Registration {
                        listener,
                        connection,
                        uid,
                        flags,
                        filters: BTreeSet::from([filter]),
                    },
                );
                next_id
            }
        };
        self.by_op.entry(filter).or_default().insert(id);
        id
    }

    /// Remove a listener from every bucket
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let Some(registration) = self.registrations.remove(&id) else {
            return false;
        };
        for filter in registration.filters {
            if let Some(bucket) = self.by_op.get_mut(&filter) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.by_op.remove(&filter);
                }
            }
        }
        true
    }

    /// Remove every listener owned by `connection`
    pub fn remove_connection(&mut self, connection: ConnectionId) -> usize {
        let ids: Vec<ListenerId> = self
            .registrations
            .iter()
            .filter(|(_, registration)| registration.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.unregister(*id);
        }
        ids.len()
    }

    /// Listeners interested in `op` for `uid`, each at most once
    ///
    /// `uid` of `None` matches every uid filter.
    pub fn matching(&self, op: OpCode, uid: Option<Uid>) -> Vec<Matched<W>> {
        let specific = self.by_op.get(&OpFilter::Op(op));
        let all = self.by_op.get(&OpFilter::All);

        let mut ids: BTreeMap<ListenerId, bool> = BTreeMap::new();
        for id in all.into_iter().flatten() {
            ids.insert(*id, true);
        }
        for id in specific.into_iter().flatten() {
            ids.insert(*id, false);
        }

        ids.into_iter()
            .filter_map(|(id, via_all)| {
                let registration = self.registrations.get(&id)?;
                let uid_matches = match (registration.uid, uid) {
                    (Some(wanted), Some(uid)) => wanted == uid,
                    _ => true,
                };
                uid_matches.then(|| Matched {
                    id,
                    listener: Arc::clone(&registration.listener),
                    flags: registration.flags,
                    via_all,
                })
            })
            .collect()
    }

    /// Whether `id` is registered here
    pub fn contains(&self, id: ListenerId) -> bool {
        self.registrations.contains_key(&id)
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Registrations of every listener kind
#[derive(Debug, Default)]
pub struct Watchers {
    /// Mode-changed listeners
    pub mode: WatcherTable<dyn ModeWatcher>,
    /// Usage-started listeners
    pub started: WatcherTable<dyn StartedWatcher>,
    /// Active-changed listeners
    pub active: WatcherTable<dyn ActiveWatcher>,
    /// Decision-noted listeners
    pub noted: WatcherTable<dyn NotedWatcher>,
    next_id: u64,
}

impl Watchers {
    /// No registrations
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for the next new registration; ids are unique across kinds
    pub fn allocate_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    /// Drop every registration of `connection`
    pub fn remove_connection(&mut self, connection: ConnectionId) -> usize {
        self.mode.remove_connection(connection)
            + self.started.remove_connection(connection)
            + self.active.remove_connection(connection)
            + self.noted.remove_connection(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appops_core::ModeChanged;

    struct Nop;

    impl ModeWatcher for Nop {
        fn on_mode_changed(&self, _event: &ModeChanged) {}
    }

    const CAMERA: OpCode = OpCode(26);
    const MIC: OpCode = OpCode(27);

    #[test]
    fn test_reregistration_reuses_id() {
        let mut watchers = Watchers::new();
        let listener: Arc<dyn ModeWatcher> = Arc::new(Nop);
        let conn = ConnectionId(1);

        let first = watchers.allocate_id();
        let id = watchers.mode.register(first, conn, Arc::clone(&listener), OpFilter::Op(CAMERA), None, WatchFlags::empty());
        let second = watchers.allocate_id();
        let again = watchers.mode.register(second, conn, Arc::clone(&listener), OpFilter::Op(MIC), None, WatchFlags::empty());
        assert_eq!(id, again);
        assert_eq!(watchers.mode.len(), 1);
        assert_eq!(watchers.mode.matching(MIC, Some(Uid(10100))).len(), 1);

        let other_conn = watchers.allocate_id();
        let separate = watchers.mode.register(other_conn, ConnectionId(2), listener, OpFilter::Op(CAMERA), None, WatchFlags::empty());
        assert_ne!(separate, id);
        assert_eq!(watchers.mode.matching(CAMERA, None).len(), 2);
    }

    #[test]
    fn test_unregister_clears_every_bucket() {
        let mut table: WatcherTable<dyn ModeWatcher> = WatcherTable::new();
        let listener: Arc<dyn ModeWatcher> = Arc::new(Nop);
        let id = table.register(ListenerId(1), ConnectionId(1), Arc::clone(&listener), OpFilter::Op(CAMERA), None, WatchFlags::empty());
        table.register(ListenerId(2), ConnectionId(1), listener, OpFilter::All, None, WatchFlags::empty());

        assert!(table.unregister(id));
        assert!(table.matching(CAMERA, None).is_empty());
        assert!(table.matching(MIC, None).is_empty());
        assert!(!table.unregister(id));
    }

    #[test]
    fn test_uid_filter_and_all_bucket() {
        let mut table: WatcherTable<dyn ModeWatcher> = WatcherTable::new();
        table.register(ListenerId(1), ConnectionId(1), Arc::new(Nop), OpFilter::All, Some(Uid(10100)), WatchFlags::empty());
        table.register(ListenerId(2), ConnectionId(1), Arc::new(Nop), OpFilter::Op(CAMERA), None, WatchFlags::empty());

        let matched = table.matching(CAMERA, Some(Uid(10101)));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, ListenerId(2));
        assert!(!matched[0].via_all);

        let matched = table.matching(MIC, Some(Uid(10100)));
        assert_eq!(matched.len(), 1);
        assert!(matched[0].via_all);

        assert_eq!(table.remove_connection(ConnectionId(1)), 2);
        assert!(table.is_empty());
    }
}
