use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed-capacity array of optionally occupied slots.
///
/// Each slot is an `Option<Arc<T>>` behind its own `std::sync::Mutex`, so this is not lock-free:
/// `compare_and_swap` compares the held pointer and swaps it inside that short critical section,
/// which is never held across an await point. Claims and releases are atomic per slot, and the
/// capacity bounds how much work can be in progress at once. Mutation of the content of a claimed
/// slot is guarded by `T` itself.
pub struct Slots<T> {
    slots: Box<[Mutex<Option<Arc<T>>>]>,
}

fn same<T>(a: Option<&Arc<T>>, b: Option<&Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl<T> Slots<T> {
    pub fn new(capacity: usize) -> Self {
        Slots {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
        }
    }

    fn slot(&self, idx: usize) -> MutexGuard<'_, Option<Arc<T>>> {
        self.slots[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn load(&self, idx: usize) -> Option<Arc<T>> {
        self.slot(idx).clone()
    }

    /// Stores `new` in slot `idx` only if it currently holds `current` (compared by pointer).
    pub fn compare_and_swap(
        &self,
        idx: usize,
        current: Option<&Arc<T>>,
        new: Option<Arc<T>>,
    ) -> bool {
        let mut slot = self.slot(idx);
        if !same(slot.as_ref(), current) {
            return false;
        }
        *slot = new;
        true
    }

    /// Claims the first free slot for `value`, returning its index, or `None` if every slot is
    /// occupied.
    pub fn claim(&self, value: Arc<T>) -> Option<usize> {
        (0..self.capacity()).find(|idx| self.compare_and_swap(*idx, None, Some(value.clone())))
    }

    /// Frees slot `idx` if it still holds `current`.
    pub fn release(&self, idx: usize, current: &Arc<T>) -> bool {
        self.compare_and_swap(idx, Some(current), None)
    }

    /// Snapshot of the occupied slots.
    pub fn occupied(&self) -> Vec<(usize, Arc<T>)> {
        (0..self.capacity())
            .filter_map(|idx| self.load(idx).map(|v| (idx, v)))
            .collect()
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<(usize, Arc<T>)> {
        (0..self.capacity())
            .filter_map(|idx| self.load(idx).map(|v| (idx, v)))
            .find(|(_, v)| predicate(v))
    }

    pub fn has_free(&self) -> bool {
        (0..self.capacity()).any(|idx| self.slot(idx).is_none())
    }

    pub fn is_empty(&self) -> bool {
        (0..self.capacity()).all(|idx| self.slot(idx).is_none())
    }
}
