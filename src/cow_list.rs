//! Copy-on-write list for read-mostly, thread-shared collections.
//!
//! Writers (wiring, listener registration) build a new `Vec` and swap it in
//! with read-copy-update; readers load the current `Arc<Vec<T>>` and iterate
//! it without taking a lock. A traversal therefore always sees one complete
//! generation of the list, never a half-applied `add` or `remove`.

use arc_swap::ArcSwap;
use std::fmt;
use std::sync::Arc;

pub struct CowList<T> {
    items: ArcSwap<Vec<T>>,
}

impl<T> CowList<T> {
    pub fn new() -> Self {
        Self {
            items: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Current generation of the list.
    pub fn snapshot(&self) -> Arc<Vec<T>> {
        self.items.load_full()
    }

    /// Visit every element of one generation.
    ///
    /// Concurrent `add`/`remove` calls do not affect a traversal in progress.
    pub fn for_each(&self, mut visitor: impl FnMut(&T)) {
        let items = self.items.load();
        for item in items.iter() {
            visitor(item);
        }
    }

    /// First element matching `predicate` in the current generation.
    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T>
    where
        T: Clone,
    {
        self.items.load().iter().find(|item| predicate(*item)).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

impl<T: Clone> CowList<T> {
    /// Append `item`; visible to every traversal that starts afterwards.
    pub fn add(&self, item: T) {
        self.items.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(item.clone());
            next
        });
    }

    /// Remove every element matching `predicate`. Returns how many went away.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut removed = 0;
        self.items.rcu(|current| {
            let next: Vec<T> = current.iter().filter(|item| !predicate(*item)).cloned().collect();
            removed = current.len() - next.len();
            next
        });
        removed
    }

    pub fn clear(&self) {
        self.items.store(Arc::new(Vec::new()));
    }
}

impl<T> Default for CowList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for CowList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.load().iter()).finish()
    }
}
