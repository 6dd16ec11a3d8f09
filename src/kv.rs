//! In-process stand-in for the KV store the engine's concurrency model
//! assumes: `SET NX EX` cooldown gates, `SET EX` last-value dedupe, and a
//! pub/sub channel for cross-task notification. A single-process
//! deployment makes a real Redis client unnecessary; this gives the same
//! semantics behind the same call shape so a future multi-process
//! deployment could swap the backing store without touching callers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct KvStore {
    entries: Mutex<HashMap<String, Entry>>,
    notify: broadcast::Sender<String>,
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        KvStore {
            entries: Mutex::new(HashMap::new()),
            notify,
        }
    }

    fn sweep_expired(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, e| e.expires_at > now);
    }

    /// `SET key value NX EX ttl_seconds`. Returns `true` if the key was
    /// absent (or expired) and has now been set; `false` if an unexpired
    /// value already occupied the key. Used for per-(event, signal_type,
    /// window-bucket) and per-venue cooldown gates.
    pub fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        self.sweep_expired(&mut entries, now);
        if entries.contains_key(key) {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_seconds),
            },
        );
        true
    }

    /// `SET key value EX ttl_seconds`, unconditional. Used for last-value
    /// dedupe (e.g. last-alerted threshold per event/market).
    pub fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_seconds),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        self.sweep_expired(&mut entries, now);
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Publish a message on the shared notification channel (e.g. "cycle
    /// completed", "degraded mode entered"). Subscribers that aren't
    /// listening simply miss it, matching Redis pub/sub semantics.
    pub fn publish(&self, message: &str) {
        let _ = self.notify.send(message.to_string());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_ex_blocks_until_expiry() {
        let kv = KvStore::new();
        assert!(kv.set_nx_ex("cooldown:evt1:MOVE", "1", 3600));
        assert!(!kv.set_nx_ex("cooldown:evt1:MOVE", "1", 3600));
    }

    #[test]
    fn set_ex_overwrites_unconditionally() {
        let kv = KvStore::new();
        kv.set_ex("last:evt1:spreads", "-3.0", 60);
        kv.set_ex("last:evt1:spreads", "-3.5", 60);
        assert_eq!(kv.get("last:evt1:spreads"), Some("-3.5".to_string()));
    }

    #[test]
    fn delete_clears_a_cooldown() {
        let kv = KvStore::new();
        kv.set_nx_ex("cooldown:evt1:STEAM", "1", 3600);
        kv.delete("cooldown:evt1:STEAM");
        assert!(kv.set_nx_ex("cooldown:evt1:STEAM", "1", 3600));
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_receiver() {
        let kv = KvStore::new();
        let mut rx = kv.subscribe();
        kv.publish("cycle_complete");
        assert_eq!(rx.recv().await.unwrap(), "cycle_complete");
    }
}
