//! A fixed-capacity, oldest-evicted ordered log.

use std::collections::VecDeque;

/// An append-only sequence that silently drops its oldest entry once `cap`
/// is exceeded. Used for `LoopState`'s `logs`/`messages`/`tool_calls`/
/// `recent_iterations` sequences, which are bounded per the data model.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    #[serde(skip)]
    cap: usize,
}

impl<T> BoundedLog<T> {
    pub fn new(cap: usize) -> Self {
        Self { entries: VecDeque::with_capacity(cap.min(256)), cap }
    }

    /// Reapplies a cap after deserialization, which always resets `cap` to
    /// `0` (unbounded) since it's skipped to keep the wire format a plain
    /// array. Does not evict; only takes effect on the next `push`.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
    }

    pub fn push(&mut self, item: T) {
        if self.cap > 0 {
            while self.entries.len() >= self.cap {
                self.entries.pop_front();
            }
        }
        self.entries.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn back_mut(&mut self) -> Option<&mut T> {
        self.entries.back_mut()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut T> {
        self.entries.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_cap() {
        let mut log = BoundedLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn cap_zero_is_unbounded() {
        let mut log: BoundedLog<u32> = BoundedLog::new(0);
        for i in 0..10 {
            log.push(i);
        }
        assert_eq!(log.len(), 10);
    }

    #[test]
    fn roundtrip_through_json_drops_cap_until_restored() {
        let mut log = BoundedLog::new(2);
        log.push(1);
        log.push(2);
        let json = serde_json::to_string(&log).unwrap();
        assert_eq!(json, "[1,2]");

        let mut restored: BoundedLog<i32> = serde_json::from_str(&json).unwrap();
        restored.push(3);
        restored.push(4);
        assert_eq!(restored.len(), 4, "cap resets to 0 (unbounded) across a roundtrip");

        restored.set_cap(2);
        restored.push(5);
        assert_eq!(restored.iter().copied().collect::<Vec<_>>(), vec![4, 5]);
    }
}
