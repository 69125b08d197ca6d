use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Mutual exclusion keyed by string, with locks created on demand.
///
/// The map holds weak handles only; a key's lock lives as long as some
/// caller holds or waits on it, and dead entries are pruned when new keys
/// are inserted. Unrelated keys never contend beyond the brief map lookup.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `key`.
    ///
    /// A panic inside a previous holder does not poison the key.
    pub fn with_lock<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let slot = self.slot(key);
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of keys whose lock is currently alive.
    pub fn live_keys(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|w| w.strong_count() > 0).count()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get(key).and_then(Weak::upgrade) {
            return slot;
        }
        slots.retain(|_, w| w.strong_count() > 0);
        let slot = Arc::new(Mutex::new(()));
        slots.insert(key.to_string(), Arc::downgrade(&slot));
        slot
    }
}
