//! Bounded, arrival-ordered message history.
//!
//! Evicts the oldest entry once the capacity is exceeded (FIFO). There is no
//! re-access concept, so this is not an LRU.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::protocol::Message;

#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Arc<Message>>,
    cap: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "History capacity must be > 0");
        Self {
            entries: VecDeque::with_capacity(capacity),
            cap: capacity,
        }
    }

    /// Append a message, returning the evicted one if the bound was exceeded.
    pub fn push(&mut self, message: Arc<Message>) -> Option<Arc<Message>> {
        self.entries.push_back(message);
        if self.entries.len() > self.cap {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Oldest-first copy of the current contents.
    pub fn snapshot(&self) -> Vec<Arc<Message>> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Message>> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(n: usize) -> Arc<Message> {
        Arc::new(Message {
            id: format!("id-{n}"),
            username: "alice".into(),
            text: format!("#{n}"),
            media: None,
            timestamp: "2024-01-01T00:00:00.000Z".into(),
        })
    }

    #[test]
    fn test_new_is_empty() {
        let h = History::new(3);
        assert!(h.is_empty());
        assert_eq!(h.capacity(), 3);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_panics() {
        let _ = History::new(0);
    }

    #[test]
    fn test_push_under_capacity_evicts_nothing() {
        let mut h = History::new(3);
        assert!(h.push(msg(1)).is_none());
        assert!(h.push(msg(2)).is_none());
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_push_over_capacity_evicts_oldest() {
        let mut h = History::new(2);
        h.push(msg(1));
        h.push(msg(2));
        let evicted = h.push(msg(3)).unwrap();
        assert_eq!(evicted.text, "#1");
        let texts: Vec<&str> = h.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["#2", "#3"]);
    }

    #[test]
    fn test_150_messages_keeps_last_100() {
        let mut h = History::new(100);
        for n in 1..=150 {
            h.push(msg(n));
        }
        assert_eq!(h.len(), 100);
        assert_eq!(h.snapshot()[0].text, "#51");
        assert_eq!(h.snapshot()[99].text, "#150");
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut h = History::new(5);
        h.push(msg(1));
        let snap = h.snapshot();
        h.push(msg(2));
        assert_eq!(snap.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_fifo_eviction_law(cap in 1usize..20, n in 0usize..60) {
            let mut h = History::new(cap);
            for i in 0..n {
                h.push(msg(i));
            }
            prop_assert!(h.len() <= cap);
            prop_assert_eq!(h.len(), n.min(cap));
            let expected: Vec<String> = (n.saturating_sub(cap)..n).map(|i| format!("#{i}")).collect();
            let actual: Vec<String> = h.iter().map(|m| m.text.clone()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
