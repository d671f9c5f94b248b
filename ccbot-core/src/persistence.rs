//! Debounced, atomic JSON state persistence.
//!
//! Wraps a serialize callback with:
//!   - `schedule_save()`: debounced write (500 ms, collapsing repeated calls)
//!   - `flush()`: cancel the timer and write immediately (shutdown path)
//!   - `load()`: read the file back, empty on missing/corrupt
//!
//! Writes go through [`crate::util::atomic_write_json`] so a crash mid-write
//! never corrupts the previous state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::util::atomic_write_json;

/// Delay between `schedule_save()` and the actual write.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

type SerializeFn = dyn Fn() -> serde_json::Value + Send + Sync;

struct SaveCtx {
    path: PathBuf,
    serialize: Box<SerializeFn>,
    dirty: AtomicBool,
}

impl SaveCtx {
    fn do_save(&self) {
        let state = (self.serialize)();
        match atomic_write_json(&self.path, &state) {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
            }
            Err(e) => tracing::error!("Failed to save state to {}: {e}", self.path.display()),
        }
    }
}

/// Debounced, atomic JSON file persistence.
pub struct StatePersistence {
    ctx: Arc<SaveCtx>,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StatePersistence {
    /// Create a persistence handle writing to `path`.
    ///
    /// `serialize` is called at write time to snapshot the owning
    /// component's state.
    pub fn new(
        path: PathBuf,
        serialize: impl Fn() -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            ctx: Arc::new(SaveCtx {
                path,
                serialize: Box::new(serialize),
                dirty: AtomicBool::new(false),
            }),
            timer: std::sync::Mutex::new(None),
        }
    }

    /// Schedule a debounced save; repeated calls collapse into one write.
    ///
    /// Outside a tokio runtime (tests, shutdown paths) the write happens
    /// immediately.
    pub fn schedule_save(&self) {
        self.ctx.dirty.store(true, Ordering::SeqCst);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.ctx.do_save();
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        let task = handle.spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            ctx.do_save();
        });

        let mut timer = self.timer.lock().expect("persistence timer lock poisoned");
        if let Some(old) = timer.replace(task) {
            old.abort();
        }
    }

    /// Force an immediate save if dirty. Call on shutdown.
    pub fn flush(&self) {
        if let Some(task) = self
            .timer
            .lock()
            .expect("persistence timer lock poisoned")
            .take()
        {
            task.abort();
        }
        if self.ctx.dirty.load(Ordering::SeqCst) {
            self.ctx.do_save();
        }
    }

    /// Read the persisted file. Returns `Value::Null` on missing or
    /// invalid content (with a warning for the latter).
    pub fn load(&self) -> serde_json::Value {
        let path = &self.ctx.path;
        if !path.exists() {
            return serde_json::Value::Null;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Failed to parse state file {}: {e}", path.display());
                    serde_json::Value::Null
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read state file {}: {e}", path.display());
                serde_json::Value::Null
            }
        }
    }
}

impl Drop for StatePersistence {
    fn drop(&mut self) {
        // Last-chance write; normal shutdown calls flush() explicitly.
        if self.ctx.dirty.load(Ordering::SeqCst) {
            self.ctx.do_save();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn shared_state() -> (Arc<Mutex<serde_json::Value>>, impl Fn() -> serde_json::Value) {
        let state = Arc::new(Mutex::new(serde_json::json!({"n": 0})));
        let snapshot = {
            let state = Arc::clone(&state);
            move || state.lock().unwrap().clone()
        };
        (state, snapshot)
    }

    #[test]
    fn test_schedule_save_without_runtime_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (_state, snapshot) = shared_state();

        let persistence = StatePersistence::new(path.clone(), snapshot);
        persistence.schedule_save();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_debounce_collapses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (state, snapshot) = shared_state();

        let persistence = StatePersistence::new(path.clone(), snapshot);
        persistence.schedule_save();
        *state.lock().unwrap() = serde_json::json!({"n": 2});
        persistence.schedule_save();

        // Nothing written before the debounce delay elapses.
        assert!(!path.exists());

        tokio::time::sleep(SAVE_DEBOUNCE + Duration::from_millis(200)).await;
        let loaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, serde_json::json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (_state, snapshot) = shared_state();

        let persistence = StatePersistence::new(path.clone(), snapshot);
        persistence.schedule_save();
        persistence.flush();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_flush_clean_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let (_state, snapshot) = shared_state();

        let persistence = StatePersistence::new(path.clone(), snapshot);
        persistence.flush();

        assert!(!path.exists());
    }

    #[test]
    fn test_load_missing_returns_null() {
        let dir = tempfile::tempdir().unwrap();
        let persistence =
            StatePersistence::new(dir.path().join("absent.json"), || serde_json::Value::Null);
        assert_eq!(persistence.load(), serde_json::Value::Null);
    }

    #[test]
    fn test_load_corrupt_returns_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let persistence = StatePersistence::new(path, || serde_json::Value::Null);
        assert_eq!(persistence.load(), serde_json::Value::Null);
    }
}
