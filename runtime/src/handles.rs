//! Handle table: small integer handles for host-owned resources.
//!
//! Handle 0 is reserved for "no handle", so allocation starts at 1 and
//! counts up to the table's limit before wrapping. Handles are unique while
//! live: after a wrap, handles still in use are skipped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Opaque handle value as seen by the core.
pub type Handle = u32;

pub struct HandleTable<T> {
    next: Handle,
    limit: Handle,
    entries: HashMap<Handle, T>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_limit(Handle::MAX)
    }

    /// A table whose handles stay within `1..=limit`.
    pub fn with_limit(limit: Handle) -> Self {
        Self {
            next: 1,
            limit: limit.max(1),
            entries: HashMap::new(),
        }
    }

    /// Store `value` under a fresh handle. `None` when every handle is live.
    pub fn insert(&mut self, value: T) -> Option<Handle> {
        if self.entries.len() >= self.limit as usize {
            return None;
        }
        loop {
            let handle = self.next;
            self.next = if handle >= self.limit { 1 } else { handle + 1 };
            if let Entry::Vacant(slot) = self.entries.entry(handle) {
                slot.insert(value);
                return Some(handle);
            }
        }
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entries.get(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        self.entries.remove(&handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every live entry, in handle order.
    pub fn drain(&mut self) -> Vec<(Handle, T)> {
        let mut drained: Vec<(Handle, T)> = self.entries.drain().collect();
        drained.sort_by_key(|(handle, _)| *handle);
        drained
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
