//! Context persistence. The browser client keys a record in local device
//! storage by a constant name; a native client has no such store, so this
//! persists the same record to a file instead. A missing or malformed
//! record is ignored rather than treated as an error.

use serde_json::Value;
use std::path::{Path, PathBuf};

pub trait ContextStore: Send + Sync {
    fn load(&self) -> Option<Value>;
    fn save(&self, context: &Value);
    fn clear(&self);
}

/// Stores the context as a single JSON file. Construction never fails: a
/// missing parent directory is created lazily on first `save`.
pub struct FileContextStore {
    path: PathBuf,
}

impl FileContextStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ContextStore for FileContextStore {
    fn load(&self) -> Option<Value> {
        let raw = std::fs::read(&self.path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn save(&self, context: &Value) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(bytes) = serde_json::to_vec(context) {
            let _ = std::fs::write(&self.path, bytes);
        }
    }

    fn clear(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Non-persistent store, useful in tests and for callers who manage
/// context entirely in memory.
#[derive(Default)]
pub struct NullContextStore;

impl ContextStore for NullContextStore {
    fn load(&self) -> Option<Value> {
        None
    }
    fn save(&self, _context: &Value) {}
    fn clear(&self) {}
}

pub fn default_path_for(client_uuid: &str) -> PathBuf {
    Path::new(".realtime-client").join(format!("{client_uuid}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_loads_as_none() {
        let store = FileContextStore::new("/tmp/realtime-client-tests/does-not-exist.json");
        assert_eq!(store.load(), None);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("rt-client-ctx-{}", std::process::id()));
        let store = FileContextStore::new(dir.join("ctx.json"));
        store.save(&json!({"user": {"id": "u1"}}));
        assert_eq!(store.load(), Some(json!({"user": {"id": "u1"}})));
        store.clear();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn malformed_record_is_ignored() {
        let dir = std::env::temp_dir().join(format!("rt-client-ctx-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ctx.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = FileContextStore::new(path);
        assert_eq!(store.load(), None);
    }
}
