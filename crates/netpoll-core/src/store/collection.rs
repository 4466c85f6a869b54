// ── Id-keyed object collection ──
//
// Lock-free concurrent storage with O(1) lookups by numeric id, an
// optional unique secondary key, and a sorted snapshot published
// through a `watch` channel on every mutation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

pub(crate) struct ObjectCollection<T: Send + Sync + 'static> {
    /// Primary storage: object id -> object.
    by_id: DashMap<u32, Arc<T>>,

    /// Secondary index, e.g. `"{zone}:{address}"` for nodes.
    key_to_id: DashMap<String, u32>,

    /// Reverse of `key_to_id` for efficient removal.
    id_to_key: DashMap<u32, String>,

    /// All objects ordered by id, rebuilt on mutation.
    snapshot: watch::Sender<Arc<Vec<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> ObjectCollection<T> {
    pub(crate) fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            key_to_id: DashMap::new(),
            id_to_key: DashMap::new(),
            snapshot,
        }
    }

    /// Insert or replace an object. Returns `true` if the id was new.
    pub(crate) fn insert(&self, id: u32, key: Option<String>, object: Arc<T>) -> bool {
        if let Some((_, old_key)) = self.id_to_key.remove(&id) {
            self.key_to_id.remove(&old_key);
        }
        if let Some(key) = key {
            self.key_to_id.insert(key.clone(), id);
            self.id_to_key.insert(id, key);
        }
        let is_new = self.by_id.insert(id, object).is_none();
        self.rebuild_snapshot();
        is_new
    }

    /// Remove an object by id. Returns the removed object if it existed.
    pub(crate) fn remove(&self, id: u32) -> Option<Arc<T>> {
        let removed = self.by_id.remove(&id).map(|(_, v)| v);
        if removed.is_some() {
            if let Some((_, key)) = self.id_to_key.remove(&id) {
                self.key_to_id.remove(&key);
            }
            self.rebuild_snapshot();
        }
        removed
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<T>> {
        self.by_id.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Id currently registered under a secondary key.
    pub(crate) fn id_for_key(&self, key: &str) -> Option<u32> {
        self.key_to_id.get(key).map(|r| *r.value())
    }

    pub(crate) fn get_by_key(&self, key: &str) -> Option<Arc<T>> {
        self.id_for_key(key).and_then(|id| self.get(id))
    }

    /// Move an object to a new secondary key.
    pub(crate) fn rekey(&self, id: u32, key: String) {
        if let Some((_, old_key)) = self.id_to_key.remove(&id) {
            self.key_to_id.remove(&old_key);
        }
        self.key_to_id.insert(key.clone(), id);
        self.id_to_key.insert(id, key);
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<Vec<Arc<T>>>> {
        self.snapshot.subscribe()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn rebuild_snapshot(&self) {
        let mut entries: Vec<(u32, Arc<T>)> = self
            .by_id
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        let values = entries.into_iter().map(|(_, v)| v).collect();
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}
