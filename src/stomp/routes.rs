//! Producer route cache.
//!
//! SEND frames resolve their destination to a router route. Routes are
//! created lazily and kept in a small LRU so a producer cycling through a
//! handful of destinations never re-connects. Evicting an entry disconnects
//! it from the router first; a forgotten-but-connected route would leak a
//! producer registration in the router.

use std::sync::Arc;

use crate::broker::{Destination, Route, Router};

pub struct ProducerRoutes {
    capacity: usize,
    /// Most recently used first.
    entries: Vec<(Destination, Arc<dyn Route>)>,
}

impl ProducerRoutes {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached route for `destination`, refreshed to most recently used.
    pub fn get(&mut self, destination: &Destination) -> Option<Arc<dyn Route>> {
        let index = self.entries.iter().position(|(d, _)| d == destination)?;
        let entry = self.entries.remove(index);
        let route = entry.1.clone();
        self.entries.insert(0, entry);
        Some(route)
    }

    /// Cache a freshly connected route. When the cache is at capacity the
    /// least recently used route is disconnected from the router and
    /// dropped.
    pub fn insert(&mut self, destination: Destination, route: Arc<dyn Route>, router: &dyn Router) {
        while self.entries.len() >= self.capacity {
            let (evicted_dest, evicted) = self.entries.pop().expect("capacity is at least one");
            tracing::debug!(destination = %evicted_dest, "evicting producer route");
            router.disconnect(&evicted);
        }
        self.entries.insert(0, (destination, route));
    }

    /// Remove every cached route for connection teardown. The caller
    /// disconnects them.
    pub fn drain(&mut self) -> Vec<Arc<dyn Route>> {
        self.entries.drain(..).map(|(_, route)| route).collect()
    }
}

impl std::fmt::Debug for ProducerRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRoutes")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
