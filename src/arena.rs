//! Expiring-entry arena for short-lived security state.
//!
//! MFA challenges, remember-device markers, OAuth `state` values, and
//! one-time tokens all follow the same shape: an opaque id mapping to a
//! record that must expire on its own, with no caller-triggered cleanup.
//! Expired entries are swept opportunistically on every access.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

pub struct ExpiringArena<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> ExpiringArena<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a value that expires `ttl` from now, replacing any prior entry
    /// under the same key.
    pub async fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.insert_until(key, value, Utc::now() + ttl).await;
    }

    /// Insert with an explicit deadline.
    pub async fn insert_until(&self, key: impl Into<String>, value: V, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        entries.insert(key.into(), Entry { value, expires_at });
    }

    /// Remove and return a live entry. Expired entries are never returned,
    /// which makes every consumer single-use by construction.
    pub async fn take(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(key)?;
        if entry.expires_at > Utc::now() {
            Some(entry.value)
        } else {
            None
        }
    }

    /// Whether a live entry exists under `key`, without consuming it.
    pub async fn contains(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        entries.contains_key(key)
    }

    /// Mutate a live entry in place under the arena lock and return the
    /// closure's result. Counter updates made here are atomic with respect
    /// to concurrent callers.
    pub async fn update<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        entries.get_mut(key).map(|entry| f(&mut entry.value))
    }

    /// Keep only entries for which the predicate holds.
    pub async fn retain(&self, mut f: impl FnMut(&str, &V) -> bool) {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.retain(|key, entry| entry.expires_at > now && f(key, &entry.value));
    }
}

impl<V: Clone> ExpiringArena<V> {
    /// Clone out a live entry without consuming it.
    pub async fn peek(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        sweep(&mut entries);
        entries.get(key).map(|entry| entry.value.clone())
    }
}

impl<V> Default for ExpiringArena<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep<V>(entries: &mut HashMap<String, Entry<V>>) {
    let now = Utc::now();
    entries.retain(|_, entry| entry.expires_at > now);
}
