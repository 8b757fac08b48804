//! Bounded LRU cache with a sliding per-entry TTL.
//!
//! Entries live in an arena (`Vec<Option<Node>>`) and are chained into a
//! doubly linked recency list by integer handle; a `HashMap` maps keys to
//! handles. `get` and `set` are O(1) on average.
//!
//! Eviction rules:
//! - inserting a new key into a full cache first evicts the least recently
//!   used entry, whether or not it has expired;
//! - every `get`/`set` then drops expired entries from the LRU end. Because a
//!   touch always moves an entry to the head with a fresh expiry, recency
//!   order is also expiry order and the sweep can stop at the first live one.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::TransportError;

/// Default number of entries.
pub const DEFAULT_CAPACITY: usize = 1_024;
/// Default sliding TTL.
pub const DEFAULT_TTL: Duration = Duration::from_millis(30_000);
/// Largest TTL accepted at construction.
pub const MAX_TTL: Duration = Duration::from_millis(1_800_000);
/// Stand-in TTL when expiry is disabled (one year).
pub const DISABLED_TTL: Duration = Duration::from_millis(31_536_000_000);

struct Node<K, V> {
    key: K,
    value: V,
    expires_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Fixed-capacity LRU map with sliding expiry.
pub struct LruCache<K, V> {
    capacity: usize,
    ttl: Duration,
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries.
    ///
    /// `ttl = None` disables expiry. An explicit TTL must lie in
    /// `(0, MAX_TTL]`. A capacity of 0 yields a cache that stores nothing.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Result<Self, TransportError> {
        let ttl = match ttl {
            None => DISABLED_TTL,
            Some(ttl) if ttl.is_zero() || ttl > MAX_TTL => {
                return Err(TransportError::Config(format!(
                    "cache TTL must be within (0, {}] ms, got {} ms",
                    MAX_TTL.as_millis(),
                    ttl.as_millis()
                )));
            }
            Some(ttl) => ttl,
        };

        Ok(Self {
            capacity,
            ttl,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up `key`, promoting it to most recently used and restarting its
    /// expiry clock. Expired entries are never returned.
    pub fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let found = match self.index.get(key).copied() {
            Some(idx) if self.expired(idx, now) => {
                self.remove_at(idx);
                None
            }
            Some(idx) => {
                self.touch(idx, now);
                self.node(idx).map(|n| n.value.clone())
            }
            None => None,
        };
        self.evict_expired(now);
        found
    }

    /// Insert or update `key`.
    pub fn set(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let now = Instant::now();

        if let Some(idx) = self.index.get(&key).copied() {
            if let Some(node) = self.node_mut(idx) {
                node.value = value;
            }
            self.touch(idx, now);
        } else {
            if self.index.len() >= self.capacity {
                if let Some(lru) = self.tail {
                    self.remove_at(lru);
                }
            }
            let node = Node {
                key: key.clone(),
                value,
                expires_at: now + self.ttl,
                prev: None,
                next: None,
            };
            let idx = match self.free.pop() {
                Some(idx) => {
                    self.slots[idx] = Some(node);
                    idx
                }
                None => {
                    self.slots.push(Some(node));
                    self.slots.len() - 1
                }
            };
            self.index.insert(key, idx);
            self.push_front(idx);
        }

        self.evict_expired(now);
    }

    /// Remove `key`, returning its value.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.index.get(key).copied()?;
        self.remove_at(idx)
    }

    /// Remove `key` only if `pred` holds for its current value.
    pub fn remove_if<Q, F>(&mut self, key: &Q, pred: F) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> bool,
    {
        let idx = self.index.get(key).copied()?;
        if !pred(&self.node(idx)?.value) {
            return None;
        }
        self.remove_at(idx)
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.node(idx) else { break };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn expired(&self, idx: usize, now: Instant) -> bool {
        self.node(idx).map_or(true, |n| n.expires_at < now)
    }

    fn touch(&mut self, idx: usize, now: Instant) {
        let ttl = self.ttl;
        if let Some(node) = self.node_mut(idx) {
            node.expires_at = now + ttl;
        }
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(lru) = self.tail {
            if !self.expired(lru, now) {
                break;
            }
            self.remove_at(lru);
        }
    }

    fn remove_at(&mut self, idx: usize) -> Option<V> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node.value)
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(idx) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.index.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
