//! Lazily allocated key/value bags attached to sessions and streams.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// An attribute value. Downcast with [`Attributes::get_as`].
pub type AttributeValue = Arc<dyn Any + Send + Sync>;

/// String-keyed attribute bag. The map is only allocated on first write.
#[derive(Default)]
pub struct Attributes {
    map: Mutex<Option<HashMap<String, AttributeValue>>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<AttributeValue> {
        self.map.lock().as_ref()?.get(key).cloned()
    }

    /// Get an attribute and downcast it to `T`.
    ///
    /// Returns `None` if the key is absent or holds a different type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key)?.downcast::<T>().ok()
    }

    /// Store a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: AttributeValue) -> Option<AttributeValue> {
        self.map
            .lock()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value)
    }

    /// Store a plain value, wrapping it in an `Arc`.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.set(key, Arc::new(value));
    }

    pub fn remove(&self, key: &str) -> Option<AttributeValue> {
        self.map.lock().as_mut()?.remove(key)
    }

    /// Sorted keys currently set.
    pub fn keys(&self) -> Vec<String> {
        let map = self.map.lock();
        let mut keys: Vec<String> = map
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    /// Whether anything was ever written.
    pub fn is_allocated(&self) -> bool {
        self.map.lock().is_some()
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attributes")
            .field("keys", &self.keys())
            .finish()
    }
}
