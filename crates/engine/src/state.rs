//! State shared by every hook of one run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value as JsonValue};

/// Cloneable handle to a mutex-guarded JSON map.
///
/// Hooks run on worker tasks concurrently; each accessor takes the lock for the
/// duration of one call. Use [`SharedState::update`] for read-modify-write.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Map<String, JsonValue>>>,
}

impl SharedState {
    pub fn new(initial: Map<String, JsonValue>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, JsonValue>> {
        // A hook that panicked mid-update leaves the map as it was written.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        self.lock().get(key).cloned()
    }

    /// Insert `value`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<JsonValue> {
        self.lock().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Run `f` with exclusive access to the map.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, JsonValue>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Map<String, JsonValue> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_the_same_map() {
        let state = SharedState::default();
        let other = state.clone();
        other.set("seen", json!(["a"]));
        assert_eq!(state.get("seen"), Some(json!(["a"])));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn update_is_atomic_across_threads() {
        let state = SharedState::new(Map::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        state.update(|map| {
                            let n = map.get("n").and_then(JsonValue::as_u64).unwrap_or(0);
                            map.insert("n".into(), json!(n + 1));
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.get("n"), Some(json!(800)));
    }

    #[test]
    fn survives_a_panicking_writer() {
        let state = SharedState::default();
        let clone = state.clone();
        let _ = std::thread::spawn(move || {
            clone.update(|map| {
                map.insert("k".into(), json!(1));
                panic!("hook failed");
            })
        })
        .join();
        assert_eq!(state.get("k"), Some(json!(1)));
    }
}
