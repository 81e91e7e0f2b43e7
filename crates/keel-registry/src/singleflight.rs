//! Keyed single-flight computation.
//!
//! `OnceMap` computes a value at most once per key; concurrent callers for
//! the same key share the in-flight computation and its result, including a
//! cached error. Used for per-(mirror, path) latest-revision lookups.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// A thread-safe compute-once cache keyed by `K`.
pub struct OnceMap<K, V> {
    cells: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        OnceMap {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value for `key`, running `init` to produce it if no caller
    /// has before. Exactly one `init` future runs per key; every caller
    /// receives a clone of the stored value.
    pub async fn get_or_init<F, Fut>(&self, key: K, init: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut cells = self.cells.lock().expect("once-map lock poisoned");
            cells
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        cell.get_or_init(init).await.clone()
    }
}
