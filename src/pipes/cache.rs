//! Opportunistic result caching for shared pipeline prefixes.
//!
//! When the same upstream computation (an expensive source plus feature
//! engineering filters) fans out to several downstream branches, inserting a
//! [`Cache`] at the branch point makes the upstream evaluate once: the first
//! complete traversal materializes the sequence and later traversals replay
//! the materialized copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::core::{Filter, Stream};

struct CacheStore<T> {
    items: Vec<T>,
    complete: bool,
}

/// A reference-counted memoization point.
///
/// Clones share the same store, so a cache can be embedded in several
/// pipeline branches. `filter()` returns a fresh iterator each call: while
/// the store is incomplete the iterator populates it from upstream, and once
/// a traversal has run to exhaustion every later iterator replays the store
/// without touching upstream again.
///
/// Population is guarded by a mutex so cached pipelines can cross worker
/// task boundaries, but it is not designed for concurrent population: each
/// worker is expected to hold its own traversal at a time, which is how
/// chunked execution drives it.
pub struct Cache<T> {
    store: Arc<Mutex<CacheStore<T>>>,
    protected: Arc<AtomicBool>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            protected: Arc::clone(&self.protected),
        }
    }
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cache<T> {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(CacheStore {
                items: Vec::new(),
                complete: false,
            })),
            protected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks this cache as protected: [`Cache::invalidate`] becomes a no-op.
    ///
    /// Used once an environment has been explicitly materialized and its
    /// cached interactions must survive any automatic invalidation sweep.
    pub fn protect(&self) {
        self.protected.store(true, Ordering::SeqCst);
    }

    pub fn is_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }

    /// Returns whether a complete traversal has been materialized.
    pub fn is_populated(&self) -> bool {
        self.store.lock().map(|s| s.complete).unwrap_or(false)
    }

    /// Drops the materialized copy so the next traversal re-reads upstream.
    ///
    /// Protected caches are left untouched.
    pub fn invalidate(&self) {
        if self.is_protected() {
            return;
        }
        if let Ok(mut store) = self.store.lock() {
            store.items.clear();
            store.complete = false;
        }
    }
}

impl<T: Clone + Send + 'static> Filter<T, T> for Cache<T> {
    fn filter(&self, items: Stream<T>) -> Stream<T> {
        Box::new(CacheIter {
            store: Arc::clone(&self.store),
            upstream: items,
            pos: 0,
            pulled: 0,
        })
    }
}

/// A traversal over a cache store.
///
/// Serves already-materialized items first, then (if the store is still
/// incomplete) continues pulling from upstream, appending each pulled item.
/// A traversal that reaches upstream exhaustion marks the store complete.
/// An abandoned partial traversal leaves a partial store behind; the next
/// traversal replays the prefix and pulls the remainder itself. The upstream
/// stream is pulled lazily, so a traversal that is fully served by the store
/// never executes the upstream chain at all.
struct CacheIter<T> {
    store: Arc<Mutex<CacheStore<T>>>,
    upstream: Stream<T>,
    /// Position of the next item to serve, counted over the store.
    pos: usize,
    /// Items this traversal has consumed from its own upstream.
    pulled: usize,
}

impl<T: Clone + Send + 'static> Iterator for CacheIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        {
            let store = self.store.lock().ok()?;
            if self.pos < store.items.len() {
                let item = store.items[self.pos].clone();
                self.pos += 1;
                return Some(item);
            }
            if store.complete {
                return None;
            }
        }

        // Store exhausted but incomplete: this traversal becomes the
        // populator. Its own upstream starts from the beginning, so first
        // discard everything the store already holds (items this traversal
        // replayed without consuming upstream).
        while self.pulled < self.pos {
            if self.upstream.next().is_none() {
                return None;
            }
            self.pulled += 1;
        }

        match self.upstream.next() {
            Some(item) => {
                self.pulled += 1;
                let mut store = self.store.lock().ok()?;
                if self.pos == store.items.len() {
                    store.items.push(item.clone());
                    self.pos += 1;
                    Some(item)
                } else {
                    // Another traversal appended concurrently; prefer the
                    // store's copy to keep all consumers consistent.
                    let stored = store.items[self.pos].clone();
                    self.pos += 1;
                    Some(stored)
                }
            }
            None => {
                let mut store = self.store.lock().ok()?;
                if self.pos == store.items.len() {
                    store.complete = true;
                }
                None
            }
        }
    }
}
