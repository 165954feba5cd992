//! Query Storage: the single hashed-key map every other component reads and
//! writes through, plus its supporting indices (tag index, prefix trie, LRU
//! eviction order, per-key GC timers).

pub mod entry;
mod gc;
mod trie;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::persist::{self, DehydratedEntry};
use crate::signal::Signal;
use entry::CacheEntry;
use gc::GarbageCollector;
use trie::PrefixTrie;

/// Object-safe view over a type-erased cache slot, used by operations
/// (eviction, invalidation, tag lookup, dehydration) that don't need to know
/// `V` at the call site.
pub trait AnyQuery {
    fn as_any(&self) -> &dyn Any;
    fn is_watched(&self) -> bool;
    fn key(&self) -> Value;
    fn tags(&self) -> HashSet<String>;
    fn mark_invalidated(&self);
    /// The wire form of this entry, or `None` if it has no data yet
    /// (spec.md §6 `dehydrate` — "emits entries whose data is defined").
    fn dehydrate(&self) -> Option<DehydratedEntry>;
}

/// A single cached entry together with the GC timer that reclaims it once
/// unwatched for `cache_time`.
pub struct QuerySlot<V> {
    pub signal: Signal<CacheEntry<V>>,
    gc: GarbageCollector,
}

impl<V: Serialize + 'static> AnyQuery for QuerySlot<V> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn is_watched(&self) -> bool {
        self.signal.is_watched()
    }

    fn key(&self) -> Value {
        self.signal.with(|e| e.key.clone())
    }

    fn tags(&self) -> HashSet<String> {
        self.signal.with(|e| e.tags.clone())
    }

    fn mark_invalidated(&self) {
        self.signal.update(|e| e.mark_invalidated());
    }

    fn dehydrate(&self) -> Option<DehydratedEntry> {
        self.signal.with(persist::dehydrate)
    }
}

impl<V: 'static> QuerySlot<V> {
    /// Builds a slot, wires GC lifecycle hooks to the signal, and arms the
    /// initial timer (an entry starts unwatched, per spec.md §4.3: "unobserved
    /// entries created without yet being subscribed also arm an initial GC
    /// timer").
    fn new(entry: CacheEntry<V>, storage: Weak<StorageInner>, hash: Rc<str>) -> Rc<Self> {
        let slot = Rc::new(QuerySlot {
            signal: Signal::new(entry),
            gc: GarbageCollector::new(),
        });

        let on_active = {
            let slot = Rc::downgrade(&slot);
            move || {
                if let Some(slot) = slot.upgrade() {
                    slot.gc.disable();
                }
            }
        };
        let on_inactive = {
            let slot = Rc::downgrade(&slot);
            let storage = storage.clone();
            let hash = hash.clone();
            move || {
                if let Some(slot) = slot.upgrade() {
                    arm(&slot, storage.clone(), hash.clone());
                }
            }
        };
        slot.signal.on_lifecycle(on_active, on_inactive);
        arm(&slot, storage, hash);
        slot
    }
}

fn arm<V: 'static>(slot: &Rc<QuerySlot<V>>, storage: Weak<StorageInner>, hash: Rc<str>) {
    let cache_time = slot.signal.with(|e| e.cache_time);
    slot.gc.arm(cache_time, move || {
        if let Some(storage) = storage.upgrade() {
            tracing::trace!(hash = %hash, "garbage-collecting unwatched entry");
            Storage(storage).delete(&hash);
        }
    });
}

fn key_parts(key: &Value) -> Vec<Value> {
    match key {
        Value::Array(parts) => parts.clone(),
        other => vec![other.clone()],
    }
}

struct StorageInner {
    entries: RefCell<HashMap<Rc<str>, Rc<dyn AnyQuery>>>,
    tag_index: RefCell<HashMap<String, HashSet<Rc<str>>>>,
    trie: RefCell<PrefixTrie>,
    lru: RefCell<VecDeque<Rc<str>>>,
    max_size: usize,
}

/// The Query Storage facade. Cheap to clone (shares one `Rc`-backed map).
#[derive(Clone)]
pub struct Storage(Rc<StorageInner>);

impl Storage {
    pub fn new(max_size: usize) -> Self {
        Storage(Rc::new(StorageInner {
            entries: RefCell::new(HashMap::new()),
            tag_index: RefCell::new(HashMap::new()),
            trie: RefCell::new(PrefixTrie::new()),
            lru: RefCell::new(VecDeque::new()),
            max_size,
        }))
    }

    fn downgrade(&self) -> Weak<StorageInner> {
        Rc::downgrade(&self.0)
    }

    /// Looks up `hash`, creating (and indexing) a fresh entry when absent and
    /// `auto_create` is set.
    ///
    /// Panics if `hash` already names an entry of a different payload type —
    /// that would mean two distinct call sites hashed to the same key while
    /// disagreeing about what it stores, which is a caller bug, not a
    /// recoverable runtime condition.
    pub fn get_or_create<V: Serialize + 'static>(
        &self,
        hash: &str,
        key: Value,
        stale_time: Duration,
        cache_time: Duration,
        auto_create: bool,
    ) -> Option<Signal<CacheEntry<V>>> {
        if let Some(existing) = self.0.entries.borrow().get(hash) {
            let slot = existing
                .as_any()
                .downcast_ref::<QuerySlot<V>>()
                .expect("Storage::get_or_create: payload type mismatch for existing hash");
            self.touch_lru(hash);
            return Some(slot.signal.clone());
        }
        if !auto_create {
            return None;
        }
        let entry = CacheEntry::new(key.clone(), stale_time, cache_time);
        Some(self.insert_new(hash, &key, entry))
    }

    fn insert_new<V: Serialize + 'static>(&self, hash: &str, key: &Value, entry: CacheEntry<V>) -> Signal<CacheEntry<V>> {
        let hash: Rc<str> = Rc::from(hash);
        let tags = entry.tags.clone();
        let slot = QuerySlot::new(entry, self.downgrade(), hash.clone());
        let signal = slot.signal.clone();
        self.index_insert(hash, key, &tags, slot);
        signal
    }

    fn index_insert<V: Serialize + 'static>(&self, hash: Rc<str>, key: &Value, tags: &HashSet<String>, slot: Rc<QuerySlot<V>>) {
        self.0.trie.borrow_mut().insert(&key_parts(key), &hash);
        for tag in tags {
            self.0
                .tag_index
                .borrow_mut()
                .entry(tag.clone())
                .or_default()
                .insert(hash.clone());
        }
        self.0.entries.borrow_mut().insert(hash.clone(), slot);
        self.touch_lru(&hash);
        self.evict_if_over_capacity();
    }

    /// Writes a fully-specified entry, creating it if absent. Used both by
    /// the Remote Executor (committing fetch results) and by hydration
    /// (`restore`).
    pub fn set<V: Serialize + 'static>(&self, hash: &str, entry: CacheEntry<V>) {
        let existing = self.0.entries.borrow().get(hash).cloned();
        match existing {
            Some(existing) => {
                let slot = existing
                    .as_any()
                    .downcast_ref::<QuerySlot<V>>()
                    .expect("Storage::set: payload type mismatch for existing hash");
                let old_tags = slot.signal.with(|e| e.tags.clone());
                let new_tags = entry.tags.clone();
                slot.signal.update(move |e| *e = entry);
                self.retag(hash, &old_tags, &new_tags);
                self.touch_lru(hash);
            }
            None => {
                let key = entry.key.clone();
                let tags = entry.tags.clone();
                let hash: Rc<str> = Rc::from(hash);
                let slot = QuerySlot::new(entry, self.downgrade(), hash.clone());
                self.index_insert(hash, &key, &tags, slot);
            }
        }
    }

    fn retag(&self, hash: &str, old_tags: &HashSet<String>, new_tags: &HashSet<String>) {
        let mut index = self.0.tag_index.borrow_mut();
        for tag in old_tags.difference(new_tags) {
            if let Some(set) = index.get_mut(tag) {
                set.remove(hash);
                if set.is_empty() {
                    index.remove(tag);
                }
            }
        }
        for tag in new_tags.difference(old_tags) {
            index
                .entry(tag.clone())
                .or_default()
                .insert(Rc::from(hash));
        }
    }

    /// Removes an entry from every index and cancels its GC timer.
    pub fn delete(&self, hash: &str) -> bool {
        let removed = self.0.entries.borrow_mut().remove(hash);
        let Some(slot) = removed else {
            return false;
        };
        let key = slot.key();
        let tags = slot.tags();
        self.0.trie.borrow_mut().remove(&key_parts(&key), hash);
        let mut index = self.0.tag_index.borrow_mut();
        for tag in &tags {
            if let Some(set) = index.get_mut(tag) {
                set.remove(hash);
                if set.is_empty() {
                    index.remove(tag);
                }
            }
        }
        drop(index);
        self.0.lru.borrow_mut().retain(|h| h.as_ref() != hash);
        true
    }

    pub fn has(&self, hash: &str) -> bool {
        self.0.entries.borrow().contains_key(hash)
    }

    pub fn get_all_keys(&self) -> Vec<Rc<str>> {
        self.0.entries.borrow().keys().cloned().collect()
    }

    /// The live entry map, for read-only iteration (spec.md §4.3 `getSnapshot`).
    pub fn get_snapshot(&self) -> HashMap<Rc<str>, Rc<dyn AnyQuery>> {
        self.0.entries.borrow().clone()
    }

    pub fn keys_by_tag(&self, tag: &str) -> HashSet<Rc<str>> {
        self.0.tag_index.borrow().get(tag).cloned().unwrap_or_default()
    }

    /// Every hashed key whose identifier starts with `prefix` (trie lookup —
    /// never a raw string-prefix scan, per spec.md §4.3).
    pub fn matching_keys(&self, prefix: &[Value]) -> HashSet<Rc<str>> {
        self.0
            .trie
            .borrow()
            .matching_keys(prefix)
            .into_iter()
            .map(Rc::from)
            .collect()
    }

    fn touch_lru(&self, hash: &str) {
        let mut lru = self.0.lru.borrow_mut();
        lru.retain(|h| h.as_ref() != hash);
        lru.push_back(Rc::from(hash));
    }

    /// Evicts least-recently-used *unwatched* entries until at or under
    /// capacity. If every entry over the cap is watched, accepts
    /// over-capacity rather than evicting an active one (spec.md §4.3).
    fn evict_if_over_capacity(&self) {
        loop {
            if self.0.entries.borrow().len() <= self.0.max_size {
                return;
            }
            let victim = {
                let lru = self.0.lru.borrow();
                let entries = self.0.entries.borrow();
                lru.iter()
                    .find(|hash| entries.get(hash.as_ref()).map(|e| !e.is_watched()).unwrap_or(false))
                    .cloned()
            };
            match victim {
                Some(hash) => {
                    self.delete(&hash);
                }
                None => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(flavor = "current_thread")]
    async fn get_or_create_without_auto_create_returns_none_for_missing_hash() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage = Storage::new(10);
                let result = storage.get_or_create::<i32>(
                    "h1",
                    json!(["x"]),
                    Duration::from_secs(5),
                    Duration::from_secs(60),
                    false,
                );
                assert!(result.is_none());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn set_then_get_or_create_returns_same_signal() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage = Storage::new(10);
                let mut entry = CacheEntry::new(json!(["x"]), Duration::from_secs(5), Duration::from_secs(60));
                entry.commit_success(42, entry::FetchDirection::Initial);
                storage.set("h1", entry);

                let signal = storage
                    .get_or_create::<i32>("h1", json!(["x"]), Duration::from_secs(5), Duration::from_secs(60), false)
                    .expect("entry should exist");
                assert_eq!(signal.with(|e| e.data), Some(42));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn delete_clears_tag_index_and_trie() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage = Storage::new(10);
                let mut entry = CacheEntry::new(json!(["user", 1]), Duration::from_secs(5), Duration::from_secs(60));
                entry.tags.insert("users".to_string());
                storage.set("h1", entry);

                assert!(storage.keys_by_tag("users").contains("h1"));
                assert!(storage.matching_keys(&[json!("user")]).contains("h1"));

                storage.delete("h1");
                assert!(storage.keys_by_tag("users").is_empty());
                assert!(storage.matching_keys(&[json!("user")]).is_empty());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn eviction_never_removes_a_watched_entry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage = Storage::new(1);
                let e1 = CacheEntry::<i32>::new(json!(["a"]), Duration::from_secs(5), Duration::from_secs(60));
                storage.set("h1", e1);
                let signal = storage
                    .get_or_create::<i32>("h1", json!(["a"]), Duration::from_secs(5), Duration::from_secs(60), false)
                    .unwrap();
                let _listener = signal.subscribe(|_| {});

                let e2 = CacheEntry::<i32>::new(json!(["b"]), Duration::from_secs(5), Duration::from_secs(60));
                storage.set("h2", e2);

                assert!(storage.has("h1"), "watched entry must survive eviction");
                assert!(storage.has("h2"));
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn eviction_removes_least_recently_used_unwatched_entry() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage = Storage::new(1);
                storage.set("h1", CacheEntry::<i32>::new(json!(["a"]), Duration::from_secs(5), Duration::from_secs(60)));
                storage.set("h2", CacheEntry::<i32>::new(json!(["b"]), Duration::from_secs(5), Duration::from_secs(60)));

                assert!(!storage.has("h1"));
                assert!(storage.has("h2"));
            })
            .await;
    }
}
