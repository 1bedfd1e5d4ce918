//! Snapshot stores and write debouncing
//!
//! The engine never writes on the call path. Mutations arm a
//! [`WriteScheduler`]; the persistence loop (or an explicit call) saves a
//! [`StateSnapshot`] once the deadline passes. Uninstalls and mode changes
//! arm the short deadline.

use appops_core::{Result, StateSnapshot, StateStore};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot kept as pretty JSON in one file
///
/// Saves go through a sibling temp file and a rename, so a crash mid-write
/// leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    /// Store backed by `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the snapshot
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<Option<StateSnapshot>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot: StateSnapshot = serde_json::from_str(&text)?;
        Ok(Some(snapshot.upgrade()?))
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp = self.temp_path();
        let text = serde_json::to_string_pretty(snapshot)?;
        fs::write(&temp, text)?;
        fs::rename(&temp, &self.path)?;
        tracing::debug!(path = %self.path.display(), "state snapshot written");
        Ok(())
    }
}

/// Snapshot kept in memory
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshot: Option<StateSnapshot>,
    saves: usize,
}

impl MemoryStateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `snapshot`
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                snapshot: Some(snapshot),
                saves: 0,
            }),
        }
    }

    /// Last saved snapshot
    pub fn current(&self) -> Option<StateSnapshot> {
        self.inner.lock().snapshot.clone()
    }

    /// Number of saves so far
    pub fn save_count(&self) -> usize {
        self.inner.lock().saves
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<Option<StateSnapshot>> {
        self.inner
            .lock()
            .snapshot
            .clone()
            .map(StateSnapshot::upgrade)
            .transpose()
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.snapshot = Some(snapshot.clone());
        inner.saves += 1;
        Ok(())
    }
}

/// Debounced write deadline on the monotonic clock
#[derive(Debug, Clone)]
pub struct WriteScheduler {
    normal_ms: u64,
    fast_ms: u64,
    due_at: Option<u64>,
}

impl WriteScheduler {
    /// Scheduler with the given delays
    pub fn new(normal_ms: u64, fast_ms: u64) -> Self {
        Self {
            normal_ms,
            fast_ms,
            due_at: None,
        }
    }

    /// Arm the normal deadline unless an earlier one is pending
    pub fn schedule(&mut self, now_elapsed_ms: u64) {
        self.arm(now_elapsed_ms + self.normal_ms);
    }

    /// Arm the fast deadline, pulling a pending one forward
    pub fn schedule_fast(&mut self, now_elapsed_ms: u64) {
        self.arm(now_elapsed_ms + self.fast_ms);
    }

    fn arm(&mut self, at: u64) {
        self.due_at = Some(self.due_at.map_or(at, |due| due.min(at)));
    }

    /// Whether a write is pending and its deadline passed
    pub fn is_due(&self, now_elapsed_ms: u64) -> bool {
        self.due_at.is_some_and(|due| now_elapsed_ms >= due)
    }

    /// Pending deadline
    pub fn due_at(&self) -> Option<u64> {
        self.due_at
    }

    /// Disarm after a write
    pub fn clear(&mut self) {
        self.due_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appops_core::{DeviceId, Mode, OpCode, Uid, UidModeEntry};

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            uid_modes: vec![UidModeEntry {
                uid: Uid(10100),
                device: DeviceId::default_device(),
                op: OpCode(26),
                mode: Mode::Ignored,
            }],
            ..StateSnapshot::default()
        }
    }

    #[test]
    fn test_json_store_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state").join("appops.json"));
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot()));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_json_store_upgrades_version_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appops.json");
        fs::write(
            &path,
            r#"{"version":1,"uid_modes":[{"uid":10100,"op":26,"mode":"ignored"}]}"#,
        )
        .unwrap();
        let loaded = JsonFileStateStore::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded, snapshot());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appops.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStateStore::new(&path).load().is_err());
    }

    #[test]
    fn test_fast_write_pulls_deadline_forward() {
        let mut scheduler = WriteScheduler::new(1_000, 100);
        scheduler.schedule(0);
        assert_eq!(scheduler.due_at(), Some(1_000));
        scheduler.schedule(500);
        assert_eq!(scheduler.due_at(), Some(1_000));
        scheduler.schedule_fast(500);
        assert_eq!(scheduler.due_at(), Some(600));
        assert!(!scheduler.is_due(599));
        assert!(scheduler.is_due(600));
        scheduler.clear();
        assert!(!scheduler.is_due(10_000));
    }
}
