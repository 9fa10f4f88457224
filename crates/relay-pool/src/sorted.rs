//! Newest-first event list merged from out-of-order sources.

use nostr_sdk::Event;

#[derive(Debug, Clone, Default)]
pub struct DescendingList {
    events: Vec<Event>,
}

impl DescendingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping created-at descending. Returns false if the id is
    /// already present.
    pub fn insert(&mut self, event: Event) -> bool {
        let ts = event.created_at;
        // First index whose timestamp is not newer than `ts`.
        let start = self.events.partition_point(|e| e.created_at > ts);
        let end = start + self.events[start..].partition_point(|e| e.created_at == ts);
        if self.events[start..end].iter().any(|e| e.id == event.id) {
            return false;
        }
        self.events.insert(end, event);
        true
    }

    pub fn extend<I: IntoIterator<Item = Event>>(&mut self, events: I) -> usize {
        events.into_iter().filter(|e| self.insert(e.clone())).count()
    }

    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }

    pub fn newest(&self) -> Option<&Event> {
        self.events.first()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop everything past the first `n` entries.
    pub fn truncate(&mut self, n: usize) {
        self.events.truncate(n);
    }

    pub fn into_vec(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::signed;
    use nostr_sdk::{Keys, Kind};

    fn times(list: &DescendingList) -> Vec<u64> {
        list.as_slice().iter().map(|e| e.created_at.as_secs()).collect()
    }

    #[test]
    fn any_order_sorts_descending() {
        let keys = Keys::generate();
        let events: Vec<_> = [30, 10, 50, 20, 40]
            .iter()
            .map(|t| signed(&keys, Kind::TextNote, &t.to_string(), *t, &[]))
            .collect();

        let mut forward = DescendingList::new();
        assert_eq!(forward.extend(events.clone()), 5);
        let mut backward = DescendingList::new();
        backward.extend(events.into_iter().rev());

        assert_eq!(times(&forward), vec![50, 40, 30, 20, 10]);
        assert_eq!(times(&backward), times(&forward));
        assert_eq!(forward.newest().map(|e| e.created_at.as_secs()), Some(50));
    }

    #[test]
    fn reinsert_is_noop() {
        let keys = Keys::generate();
        let a = signed(&keys, Kind::TextNote, "a", 10, &[]);
        let b = signed(&keys, Kind::TextNote, "b", 20, &[]);

        let mut list = DescendingList::new();
        assert!(list.insert(a.clone()));
        assert!(list.insert(b.clone()));
        assert!(!list.insert(a));
        assert!(!list.insert(b));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn equal_timestamps_are_kept_once_each() {
        let keys = Keys::generate();
        let a = signed(&keys, Kind::TextNote, "a", 10, &[]);
        let b = signed(&keys, Kind::TextNote, "b", 10, &[]);
        let c = signed(&keys, Kind::TextNote, "c", 10, &[]);

        let mut list = DescendingList::new();
        list.extend([a.clone(), b.clone(), c.clone(), b, a]);
        assert_eq!(list.len(), 3);

        list.truncate(1);
        assert_eq!(list.into_vec().len(), 1);
    }
}
