//! Watchers that record what they are told

use appops_core::{
    ActiveWatcher, ModeChanged, ModeWatcher, NotedWatcher, OpActiveChanged, OpNoted, OpStarted,
    StartedWatcher,
};
use parking_lot::Mutex;

/// One event seen by a [`RecordingWatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedEvent {
    /// Mode changed
    Mode(ModeChanged),
    /// Usage started, failed or resumed
    Started(OpStarted),
    /// Usage became active or inactive
    Active(OpActiveChanged),
    /// One-shot decision
    Noted(OpNoted),
}

/// Watcher implementing every listener trait, keeping events in arrival order
#[derive(Debug, Default)]
pub struct RecordingWatcher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingWatcher {
    /// Empty watcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Number of events so far
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Drop recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Mode-changed events only
    pub fn mode_changes(&self) -> Vec<ModeChanged> {
        self.filter(|event| match event {
            RecordedEvent::Mode(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Started events only
    pub fn started(&self) -> Vec<OpStarted> {
        self.filter(|event| match event {
            RecordedEvent::Started(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Active-changed events only
    pub fn active_changes(&self) -> Vec<OpActiveChanged> {
        self.filter(|event| match event {
            RecordedEvent::Active(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Noted events only
    pub fn noted(&self) -> Vec<OpNoted> {
        self.filter(|event| match event {
            RecordedEvent::Noted(e) => Some(e.clone()),
            _ => None,
        })
    }

    fn filter<T>(&self, f: impl Fn(&RecordedEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }

    fn push(&self, event: RecordedEvent) {
        self.events.lock().push(event);
    }
}

impl ModeWatcher for RecordingWatcher {
    fn on_mode_changed(&self, event: &ModeChanged) {
        self.push(RecordedEvent::Mode(event.clone()));
    }
}

impl StartedWatcher for RecordingWatcher {
    fn on_op_started(&self, event: &OpStarted) {
        self.push(RecordedEvent::Started(event.clone()));
    }
}

impl ActiveWatcher for RecordingWatcher {
    fn on_active_changed(&self, event: &OpActiveChanged) {
        self.push(RecordedEvent::Active(event.clone()));
    }
}

impl NotedWatcher for RecordingWatcher {
    fn on_op_noted(&self, event: &OpNoted) {
        self.push(RecordedEvent::Noted(event.clone()));
    }
}

/// Watcher that panics on every delivery
#[derive(Debug, Default)]
pub struct PanickingWatcher;

impl ModeWatcher for PanickingWatcher {
    fn on_mode_changed(&self, event: &ModeChanged) {
        panic!("mode watcher failure for {}", event.op);
    }
}

impl NotedWatcher for PanickingWatcher {
    fn on_op_noted(&self, event: &OpNoted) {
        panic!("noted watcher failure for {}", event.op);
    }
}
