//! TTL-based method result memoization, keyed on method name + normalized
//! params.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

pub struct ResultCache {
    entries: Mutex<HashMap<String, (Instant, Value)>>,
}

impl ResultCache {
    pub fn new() -> Self {
        ResultCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(key) {
            Some((expires_at, value)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(key, (Instant::now() + ttl, value));
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a stable cache key from a method name and its params, independent
/// of object key order.
pub fn cache_key(method: &str, params: &Value) -> String {
    format!("{method}:{}", canonical_json(params))
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_cache_key() {
        let a = cache_key("ping", &json!({"x": 1, "y": 2}));
        let b = cache_key("ping", &json!({"y": 2, "x": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = ResultCache::new();
        cache.put("k".into(), json!(1), Duration::from_millis(10));
        assert_eq!(cache.get("k"), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }
}
