//! FIFO of resources waiting for the GPU.
//!
//! Pools hand transient resources out, take them back tagged with the fence value of the
//! submission that last used them and only make them available again once that value is
//! complete. Since completion on a timeline is monotonic, the oldest entry is the first one
//! that can become free, so promotion only ever looks at the front of the list.

use std::collections::VecDeque;

use crate::fence::FenceValue;

/// Resources retired under a fence, oldest first.
#[derive(Debug)]
pub struct RetiredList<T> {
    items: VecDeque<(FenceValue, T)>,
}

impl<T> Default for RetiredList<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> RetiredList<T> {
    pub fn retire(&mut self, fence: FenceValue, item: T) {
        self.items.push_back((fence, item));
    }

    /// Removes the oldest entry if `ready` accepts it.
    pub fn pop_front_if(&mut self, ready: impl FnOnce(FenceValue, &T) -> bool) -> Option<T> {
        let (fence, item) = self.items.front()?;
        if ready(*fence, item) {
            self.items.pop_front().map(|(_, item)| item)
        } else {
            None
        }
    }

    /// Removes entries from the front for as long as `ready` accepts them, stopping at the
    /// first one it rejects.
    pub fn drain_ready<'a>(
        &'a mut self,
        mut ready: impl FnMut(FenceValue, &T) -> bool + 'a,
    ) -> impl Iterator<Item = T> + 'a {
        std::iter::from_fn(move || self.pop_front_if(&mut ready))
    }

    /// Removes everything regardless of completion. Only used at teardown.
    pub fn drain_all(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueueKind;

    fn f(seq: u64) -> FenceValue {
        FenceValue::new(QueueKind::Graphics, seq)
    }

    #[test]
    fn stops_at_first_incomplete() {
        let mut list = RetiredList::default();
        list.retire(f(1), 'a');
        list.retire(f(3), 'b');
        list.retire(f(2), 'c');
        let completed = f(2);
        let ready: Vec<_> = list.drain_ready(|fence, _| fence <= completed).collect();
        assert_eq!(ready, vec!['a']);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn predicate_sees_item() {
        let mut list = RetiredList::default();
        list.retire(f(1), 10);
        assert_eq!(list.pop_front_if(|_, item| *item > 10), None);
        assert_eq!(list.pop_front_if(|_, item| *item == 10), Some(10));
        assert!(list.is_empty());
    }
}
