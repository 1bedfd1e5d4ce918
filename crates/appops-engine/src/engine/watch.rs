//! Watcher registration verbs

use appops_core::{
    ActiveWatcher, CallerContext, ConnectionId, ListenerId, ModeWatcher, NotedWatcher, Privileges,
    Result, StartedWatcher, Uid, WatchFlags,
};
use std::sync::Arc;

use super::AppOpsEngine;
use crate::watchers::{OpFilter, WatcherTable, Watchers};

impl AppOpsEngine {
    /// Listen for mode changes of `filter`'s switch op
    ///
    /// Callers without `GET_STATS` only hear about their own uid.
    pub fn watch_mode_changes(
        &self,
        caller: &CallerContext,
        connection: ConnectionId,
        listener: Arc<dyn ModeWatcher>,
        filter: OpFilter,
        uid: Option<Uid>,
        flags: WatchFlags,
    ) -> Result<ListenerId> {
        let filter = match filter {
            OpFilter::Op(op) => OpFilter::Op(self.op_info(op)?.switch),
            OpFilter::All => OpFilter::All,
        };
        let uid = self.visible_uid(caller, uid);
        Ok(self.register(connection, listener, filter, uid, flags, "mode", |watchers| {
            &mut watchers.mode
        }))
    }

    /// Listen for usage starts, failed starts and resumes
    pub fn watch_started(
        &self,
        caller: &CallerContext,
        connection: ConnectionId,
        listener: Arc<dyn StartedWatcher>,
        filter: OpFilter,
        uid: Option<Uid>,
    ) -> Result<ListenerId> {
        self.check_filter(filter)?;
        let uid = self.visible_uid(caller, uid);
        Ok(self.register(connection, listener, filter, uid, WatchFlags::empty(), "started", |watchers| {
            &mut watchers.started
        }))
    }

    /// Listen for usages becoming active or inactive
    pub fn watch_active(
        &self,
        caller: &CallerContext,
        connection: ConnectionId,
        listener: Arc<dyn ActiveWatcher>,
        filter: OpFilter,
        uid: Option<Uid>,
    ) -> Result<ListenerId> {
        self.check_filter(filter)?;
        let uid = self.visible_uid(caller, uid);
        Ok(self.register(connection, listener, filter, uid, WatchFlags::empty(), "active", |watchers| {
            &mut watchers.active
        }))
    }

    /// Listen for note decisions
    pub fn watch_noted(
        &self,
        caller: &CallerContext,
        connection: ConnectionId,
        listener: Arc<dyn NotedWatcher>,
        filter: OpFilter,
        uid: Option<Uid>,
    ) -> Result<ListenerId> {
        self.check_filter(filter)?;
        let uid = self.visible_uid(caller, uid);
        Ok(self.register(connection, listener, filter, uid, WatchFlags::empty(), "noted", |watchers| {
            &mut watchers.noted
        }))
    }

    /// Remove a mode listener from every op
    pub fn stop_watching_mode(&self, id: ListenerId) -> bool {
        self.state.lock().watchers.mode.unregister(id)
    }

    /// Remove a started listener
    pub fn stop_watching_started(&self, id: ListenerId) -> bool {
        self.state.lock().watchers.started.unregister(id)
    }

    /// Remove an active listener
    pub fn stop_watching_active(&self, id: ListenerId) -> bool {
        self.state.lock().watchers.active.unregister(id)
    }

    /// Remove a noted listener
    pub fn stop_watching_noted(&self, id: ListenerId) -> bool {
        self.state.lock().watchers.noted.unregister(id)
    }

    /// Drop every listener registered through `connection`
    pub fn connection_closed(&self, connection: ConnectionId) -> usize {
        let removed = self.state.lock().watchers.remove_connection(connection);
        tracing::debug!(connection = %connection, removed, "connection closed");
        removed
    }

    fn check_filter(&self, filter: OpFilter) -> Result<()> {
        if let OpFilter::Op(op) = filter {
            self.op_info(op)?;
        }
        Ok(())
    }

    fn visible_uid(&self, caller: &CallerContext, uid: Option<Uid>) -> Option<Uid> {
        if caller.has(Privileges::GET_STATS) {
            uid
        } else {
            Some(caller.uid)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register<W: ?Sized>(
        &self,
        connection: ConnectionId,
        listener: Arc<W>,
        filter: OpFilter,
        uid: Option<Uid>,
        flags: WatchFlags,
        kind: &'static str,
        table: impl FnOnce(&mut Watchers) -> &mut WatcherTable<W>,
    ) -> ListenerId {
        let mut state = self.state.lock();
        let next = state.watchers.allocate_id();
        let id = table(&mut state.watchers).register(next, connection, listener, filter, uid, flags);
        tracing::debug!(listener = %id, connection = %connection, filter = ?filter, uid = ?uid, kind, "watcher registered");
        id
    }
}
