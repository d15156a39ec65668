//! Time-bounded key/value cache with destructive lookup.
//!
//! This is the correlation primitive of the engine: the client parks a
//! one-shot resolver per in-flight transaction id, and either a matching
//! response claims it ([`TtlCache::get`] removes the entry, so at-most-one
//! resolution is structural) or the armed deadline fires first, evicts the
//! entry and runs the `on_expire` callback. The same primitive, with a much
//! longer TTL and the non-destructive [`TtlCache::peek`], memoizes one-time
//! channel-setup futures in the bridge transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Callback fired when an entry's deadline elapses before it is claimed.
pub type OnExpire = Box<dyn FnOnce(&str) + Send>;

/// Per-insertion options: a TTL override and an expiry callback.
#[derive(Default)]
pub struct PutOptions {
    /// Deadline override; the cache default applies when `None`
    pub ttl: Option<Duration>,
    /// Fired after the entry is evicted by its deadline
    pub on_expire: Option<OnExpire>,
}

struct Entry<V> {
    value: V,
    deadline: JoinHandle<()>,
}

/// A mapping from string keys to values, each entry armed with a deadline.
///
/// `get` is destructive: an entry is claimed exactly once, by the lookup or
/// by the deadline, never both. Cloning the cache shares the underlying
/// entries.
///
/// # Example
///
/// ```
/// use framelink_common::cache::{PutOptions, TtlCache};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(10));
/// cache.put("k", 7, PutOptions::default());
/// assert_eq!(cache.get("k"), Some(7));
/// assert_eq!(cache.get("k"), None);
/// # }
/// ```
pub struct TtlCache<V> {
    default_ttl: Duration,
    entries: Arc<Mutex<HashMap<String, Entry<V>>>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        TtlCache {
            default_ttl: self.default_ttl,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V: Send + 'static> TtlCache<V> {
    /// Creates a cache whose entries expire after `default_ttl` unless a
    /// per-insertion TTL overrides it.
    pub fn new(default_ttl: Duration) -> Self {
        TtlCache {
            default_ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stores `value` under `key` and arms its deadline. A previous entry
    /// under the same key is replaced and its deadline disarmed.
    ///
    /// Must be called from within a tokio runtime (the deadline is a spawned
    /// timer task).
    pub fn put(&self, key: impl Into<String>, value: V, opts: PutOptions) {
        let key = key.into();
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        let deadline = self.arm(key.clone(), ttl, opts.on_expire);
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(previous) = entries.insert(key, Entry { value, deadline }) {
            previous.deadline.abort();
        }
    }

    /// Removes and returns the value under `key`, disarming its deadline.
    pub fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.lock().expect("cache lock poisoned").remove(key)?;
        entry.deadline.abort();
        Some(entry.value)
    }

    /// Returns a clone of the value under `key` without removing it.
    pub fn peek(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        let entries = self.entries.lock().expect("cache lock poisoned");
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Returns the value under `key`, inserting the one produced by `init`
    /// first when absent. The check and the insertion happen under one lock,
    /// so concurrent callers observe a single insertion.
    pub fn peek_or_insert_with(&self, key: &str, init: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            return entry.value.clone();
        }
        let value = init();
        let deadline = self.arm(key.to_string(), self.default_ttl, None);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                deadline,
            },
        );
        value
    }

    /// Evicts every entry and disarms all deadlines; no expiry callbacks run.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        for (_, entry) in entries.drain() {
            entry.deadline.abort();
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn arm(&self, key: String, ttl: Duration, on_expire: Option<OnExpire>) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let expired = entries
                .lock()
                .expect("cache lock poisoned")
                .remove(&key)
                .is_some();
            // The lookup may have claimed the entry between the deadline
            // elapsing and this task running; only the winner fires.
            if expired {
                if let Some(callback) = on_expire {
                    callback(&key);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_get_is_destructive() {
        let cache: TtlCache<&str> = TtlCache::new(Duration::from_secs(5));
        cache.put("tx", "value", PutOptions::default());
        assert_eq!(cache.get("tx"), Some("value"));
        assert_eq!(cache.get("tx"), None);
    }

    #[tokio::test]
    async fn test_expiry_fires_once_and_evicts() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_millis(20));
        let counter = Arc::clone(&fired);
        cache.put(
            "tx",
            1,
            PutOptions {
                ttl: None,
                on_expire: Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("tx"), None);
    }

    #[tokio::test]
    async fn test_claimed_entry_never_expires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_millis(20));
        let counter = Arc::clone(&fired);
        cache.put(
            "tx",
            1,
            PutOptions {
                ttl: None,
                on_expire: Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );
        assert_eq!(cache.get("tx"), Some(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ttl_override() {
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_millis(10));
        cache.put(
            "tx",
            1,
            PutOptions {
                ttl: Some(Duration::from_secs(5)),
                on_expire: None,
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("tx"), Some(1));
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_secs(5));
        cache.put("k", 9, PutOptions::default());
        assert_eq!(cache.peek("k"), Some(9));
        assert_eq!(cache.get("k"), Some(9));
    }

    #[tokio::test]
    async fn test_peek_or_insert_with_inserts_once() {
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_secs(5));
        let first = cache.peek_or_insert_with("k", || 1);
        let second = cache.peek_or_insert_with("k", || 2);
        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_replacement_disarms_previous_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cache: TtlCache<u8> = TtlCache::new(Duration::from_millis(20));
        let counter = Arc::clone(&fired);
        cache.put(
            "tx",
            1,
            PutOptions {
                ttl: None,
                on_expire: Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            },
        );
        cache.put(
            "tx",
            2,
            PutOptions {
                ttl: Some(Duration::from_secs(5)),
                on_expire: None,
            },
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(cache.get("tx"), Some(2));
    }
}
