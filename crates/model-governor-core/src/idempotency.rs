// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Bounded idempotency cache.
//!
//! Maps an idempotency key to the response first produced for it.  Retention
//! is bounded: once `capacity` keys are held, inserting a new key evicts the
//! oldest one.  A retry that arrives after its key was evicted is evaluated
//! again as a fresh request.

use std::collections::VecDeque;

use hashbrown::HashMap;

/// Insertion-ordered, capacity-bounded map from idempotency key to response.
///
/// # Examples
///
/// ```rust
/// use model_governor_core::idempotency::IdempotencyCache;
///
/// let mut cache = IdempotencyCache::new(2);
/// cache.insert("a", 1);
/// cache.insert("b", 2);
/// cache.insert("c", 3);
///
/// assert_eq!(cache.get("a"), None);
/// assert_eq!(cache.get("c"), Some(&3));
/// ```
#[derive(Debug, Clone)]
pub struct IdempotencyCache<V> {
    capacity: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> IdempotencyCache<V> {
    /// Create a cache holding at most `capacity` keys (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    /// Store `value` under `key`.
    ///
    /// An existing key keeps its first value; the original response is the one
    /// that must be replayed.
    pub fn insert(&mut self, key: &str, value: V) {
        if self.entries.contains_key(key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.entries.insert(key.to_owned(), value);
        self.order.push_back(key.to_owned());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
