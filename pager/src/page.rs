use crate::Slot;
use std::time::{Duration, SystemTime};

/// A contiguous run of [Slot]s covering one page of the index space.
///
/// `slots[k]` always holds index `first + k`.
pub(crate) struct Page<T> {
    /// Unique (per cache) identifier of this page object, used to match completions to the
    /// page that requested them.
    id: u64,
    first: u64,
    slots: Vec<Slot<T>>,
    touched: SystemTime,
}

impl<T: Clone> Page<T> {
    pub(crate) fn new(id: u64, first: u64, length: usize, now: SystemTime) -> Self {
        let slots = (0..length as u64)
            .map(|offset| Slot::new(first + offset))
            .collect();
        Self {
            id,
            first,
            slots,
            touched: now,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, offset: usize) -> Option<&Slot<T>> {
        self.slots.get(offset)
    }

    pub(crate) fn slot_mut(&mut self, offset: usize) -> Option<&mut Slot<T>> {
        self.slots.get_mut(offset)
    }

    /// Store `items` in the page, reusing existing [Slot]s.
    ///
    /// If the source returned more items than the page has [Slot]s, new [Slot]s are appended;
    /// if it returned fewer, trailing [Slot]s are dropped.
    pub(crate) fn populate(&mut self, items: Vec<T>) {
        self.slots.truncate(items.len());
        let existing = self.slots.len();
        for (offset, item) in items.into_iter().enumerate() {
            if offset >= existing {
                self.slots.push(Slot::new(self.first + offset as u64));
            }
            self.slots[offset].set(item);
        }
    }

    pub(crate) fn is_in_use(&self) -> bool {
        self.slots.iter().any(Slot::is_in_use)
    }

    pub(crate) fn touch(&mut self, now: SystemTime) {
        self.touched = now;
    }

    /// Time since the page was last touched (zero if the clock went backwards).
    pub(crate) fn idle(&self, now: SystemTime) -> Duration {
        now.duration_since(self.touched).unwrap_or_default()
    }
}
