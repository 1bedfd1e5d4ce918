//! Delivery queue between the engine and its listeners
//!
//! Mutators push [`Notification`]s while holding the engine lock; a single
//! [`NotificationDispatcher`] drains them and invokes listeners with no lock
//! held. Messages are delivered in push order. A listener that panics loses
//! that one message and stays registered.

use appops_core::{
    ActiveWatcher, ListenerId, ModeChanged, ModeWatcher, NotedWatcher, OpActiveChanged, OpNoted,
    OpStarted, StartedWatcher,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One message for one listener
pub enum Notification {
    /// Mode change
    Mode {
        /// Target registration
        id: ListenerId,
        /// Listener object
        listener: Arc<dyn ModeWatcher>,
        /// Payload
        event: ModeChanged,
    },
    /// Usage start
    Started {
        /// Target registration
        id: ListenerId,
        /// Listener object
        listener: Arc<dyn StartedWatcher>,
        /// Payload
        event: OpStarted,
    },
    /// Active transition
    Active {
        /// Target registration
        id: ListenerId,
        /// Listener object
        listener: Arc<dyn ActiveWatcher>,
        /// Payload
        event: OpActiveChanged,
    },
    /// Note decision
    Noted {
        /// Target registration
        id: ListenerId,
        /// Listener object
        listener: Arc<dyn NotedWatcher>,
        /// Payload
        event: OpNoted,
    },
}

impl Notification {
    fn id(&self) -> ListenerId {
        match self {
            Notification::Mode { id, .. }
            | Notification::Started { id, .. }
            | Notification::Active { id, .. }
            | Notification::Noted { id, .. } => *id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Notification::Mode { .. } => "mode",
            Notification::Started { .. } => "started",
            Notification::Active { .. } => "active",
            Notification::Noted { .. } => "noted",
        }
    }

    fn deliver(&self) {
        match self {
            Notification::Mode { listener, event, .. } => listener.on_mode_changed(event),
            Notification::Started { listener, event, .. } => listener.on_op_started(event),
            Notification::Active { listener, event, .. } => listener.on_active_changed(event),
            Notification::Noted { listener, event, .. } => listener.on_op_noted(event),
        }
    }
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("kind", &self.kind())
            .field("id", &self.id())
            .finish()
    }
}

/// Sending half, owned by the engine
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<Notification>,
}

impl NotificationQueue {
    /// Linked queue and dispatcher
    pub fn channel() -> (Self, NotificationDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, NotificationDispatcher { rx })
    }

    /// Enqueue a message; never blocks
    pub fn push(&self, notification: Notification) {
        if let Err(err) = self.tx.send(notification) {
            tracing::debug!(kind = err.0.kind(), "dispatcher gone, dropping notification");
        }
    }
}

/// Receiving half; delivers messages to listeners
#[derive(Debug)]
pub struct NotificationDispatcher {
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationDispatcher {
    /// Deliver until the engine is dropped
    pub async fn run(mut self) {
        tracing::info!("notification dispatcher started");
        while let Some(notification) = self.rx.recv().await {
            Self::deliver(&notification);
        }
        tracing::info!("notification dispatcher stopped");
    }

    /// Deliver everything already queued without waiting; returns the count
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(notification) = self.rx.try_recv() {
            Self::deliver(&notification);
            delivered += 1;
        }
        delivered
    }

    fn deliver(notification: &Notification) {
        let outcome = catch_unwind(AssertUnwindSafe(|| notification.deliver()));
        if outcome.is_err() {
            tracing::warn!(
                listener = %notification.id(),
                kind = notification.kind(),
                "listener panicked; message skipped"
            );
        }
    }
}
