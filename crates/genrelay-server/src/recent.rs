// Bounded recency set
// Decision: Eviction is insertion-ordered (oldest first); re-inserting does not refresh.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Set that remembers at most `capacity` items
#[derive(Debug)]
pub struct RecentSet<T: Eq + Hash> {
    members: LruCache<T, ()>,
}

impl<T: Eq + Hash> RecentSet<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            members: LruCache::new(capacity),
        }
    }

    /// Returns `false` if the item was already present
    pub fn insert(&mut self, item: T) -> bool {
        // `contains` leaves the recency order untouched
        if self.members.contains(&item) {
            return false;
        }
        self.members.put(item, ());
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.members.contains(item)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = RecentSet::new(3);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.contains(&1));
        assert!(!set.contains(&2));
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut set = RecentSet::new(2);
        set.insert("a");
        set.insert("b");
        set.insert("c");

        assert_eq!(set.len(), 2);
        assert!(!set.contains(&"a"));
        assert!(set.contains(&"b"));
        assert!(set.contains(&"c"));
    }

    #[test]
    fn test_duplicate_insert_does_not_refresh() {
        let mut set = RecentSet::new(2);
        set.insert("a");
        set.insert("b");
        assert!(!set.insert("a"));
        assert!(set.contains(&"a"));
        set.insert("c");

        assert!(!set.contains(&"a"));
        assert!(set.contains(&"b"));
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut set = RecentSet::new(0);
        set.insert(1);
        set.insert(2);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&2));
    }
}
