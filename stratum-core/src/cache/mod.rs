//! Bounded recency cache for deduplicating index writes
//!
//! Membership is a best-effort hint, never authoritative: a miss on an
//! already-indexed key is safe (the re-insert is idempotent), and a
//! false positive is impossible because the write pipeline removes
//! entries whose index writes failed before anyone can trust them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

const NIL: usize = usize::MAX;

/// Fixed-capacity, access-ordered cache. `check_and_insert` is a single
/// atomic insert-if-absent-return-previous; inserting past capacity
/// evicts the least-recently-touched entry.
pub struct DedupCache<K: Eq + Hash + Clone> {
    capacity: usize,
    inner: Mutex<Inner<K>>,
    hits: AtomicU64,
}

struct Inner<K> {
    map: HashMap<K, usize>,
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

struct Node<K> {
    key: K,
    prev: usize,
    next: usize,
}

impl<K: Eq + Hash + Clone> DedupCache<K> {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "dedup cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity),
                nodes: Vec::with_capacity(capacity),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
            hits: AtomicU64::new(0),
        }
    }

    /// Insert the key if absent. Returns true when the key was already
    /// present (a dedup hit); either way the key becomes the
    /// most-recently-used entry.
    pub fn check_and_insert(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.map.get(key) {
            inner.unlink(slot);
            inner.push_front(slot);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if inner.map.len() >= self.capacity {
            inner.evict_tail();
        }
        let slot = inner.alloc(key.clone());
        inner.push_front(slot);
        inner.map.insert(key.clone(), slot);
        false
    }

    /// Drop a key, e.g. to roll back an entry whose index write failed.
    /// Returns true if it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.remove(key) {
            Some(slot) => {
                inner.unlink(slot);
                inner.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of dedup hits since construction
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K: Eq + Hash + Clone> Inner<K> {
    fn alloc(&mut self, key: K) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot].key = key;
                slot
            }
            None => {
                self.nodes.push(Node {
                    key,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn push_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn evict_tail(&mut self) {
        let slot = self.tail;
        debug_assert_ne!(slot, NIL);
        self.unlink(slot);
        let key = self.nodes[slot].key.clone();
        self.map.remove(&key);
        self.free.push(slot);
    }
}
