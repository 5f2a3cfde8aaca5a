//! Per-service endpoint registry
//!
//! An ordered map from tunnel pid to Host Record with a round-robin
//! cursor. Entries are kept in a slab of doubly-linked slots plus a
//! pid index, so add, remove, and rotation are all O(1). Rotation
//! follows insertion order; removing the entry under the cursor parks
//! the cursor on its predecessor, so the next rotation continues with
//! the removed entry's successor. Entries inserted during a rotation
//! are visited on the next full cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tr_core::types::Host;

/// Reference to a registry entry as handed out by
/// [`EndpointRegistry::next`].
///
/// A handle taken before a concurrent removal may go stale; passing a
/// stale handle to [`EndpointRegistry::remove_el`] is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHandle {
    slot: usize,
    pid: i32,
}

impl EndpointHandle {
    /// Pid of the endpoint this handle referred to.
    pub fn pid(&self) -> i32 {
        self.pid
    }
}

struct Slot {
    pid: i32,
    host: Arc<Host>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<i32, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    cursor: Option<usize>,
}

/// Ordered set of live endpoints for one logical service.
#[derive(Default)]
pub struct EndpointRegistry {
    inner: Mutex<Inner>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `host` at the tail, or replace it in place when `pid` is
    /// already present (order undisturbed). Returns the entry count
    /// before the call.
    pub fn add(&self, pid: i32, host: Arc<Host>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let prior = inner.index.len();

        if let Some(&slot) = inner.index.get(&pid) {
            if let Some(entry) = inner.slots[slot].as_mut() {
                entry.host = host;
            }
            return prior;
        }

        let tail = inner.tail;
        let slot = Slot {
            pid,
            host,
            prev: tail,
            next: None,
        };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.slots[idx] = Some(slot);
                idx
            }
            None => {
                inner.slots.push(Some(slot));
                inner.slots.len() - 1
            }
        };

        match tail {
            Some(tail) => {
                if let Some(entry) = inner.slots[tail].as_mut() {
                    entry.next = Some(idx);
                }
            }
            None => inner.head = Some(idx),
        }
        inner.tail = Some(idx);
        inner.index.insert(pid, idx);
        prior
    }

    /// Remove the endpoint keyed by `pid` if present.
    pub fn remove(&self, pid: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.index.get(&pid).copied() {
            unlink(&mut inner, idx);
        }
    }

    /// Remove the entry a handle refers to; stale handles are ignored.
    pub fn remove_el(&self, handle: EndpointHandle) {
        let mut inner = self.inner.lock().unwrap();
        let live = matches!(
            inner.slots.get(handle.slot),
            Some(Some(slot)) if slot.pid == handle.pid
        );
        if live {
            unlink(&mut inner, handle.slot);
        }
    }

    /// Advance the cursor one position (wrapping) and return the entry
    /// now under it, or `None` when the registry is empty.
    pub fn next(&self) -> Option<(EndpointHandle, Arc<Host>)> {
        let mut inner = self.inner.lock().unwrap();
        let next = match inner.cursor {
            None => inner.head?,
            Some(cursor) => inner.slots[cursor]
                .as_ref()
                .and_then(|slot| slot.next)
                .or(inner.head)?,
        };
        inner.cursor = Some(next);
        let slot = inner.slots[next].as_ref()?;
        Some((
            EndpointHandle {
                slot: next,
                pid: slot.pid,
            },
            Arc::clone(&slot.host),
        ))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pids in insertion order.
    pub fn pids(&self) -> Vec<i32> {
        let inner = self.inner.lock().unwrap();
        let mut pids = Vec::with_capacity(inner.index.len());
        let mut at = inner.head;
        while let Some(idx) = at {
            let Some(slot) = inner.slots[idx].as_ref() else {
                break;
            };
            pids.push(slot.pid);
            at = slot.next;
        }
        pids
    }
}

fn unlink(inner: &mut Inner, idx: usize) {
    let Some(slot) = inner.slots[idx].take() else {
        return;
    };
    inner.index.remove(&slot.pid);

    match slot.prev {
        Some(prev) => {
            if let Some(entry) = inner.slots[prev].as_mut() {
                entry.next = slot.next;
            }
        }
        None => inner.head = slot.next,
    }
    match slot.next {
        Some(next) => {
            if let Some(entry) = inner.slots[next].as_mut() {
                entry.prev = slot.prev;
            }
        }
        None => inner.tail = slot.prev,
    }

    if inner.cursor == Some(idx) {
        // park on the predecessor; the next rotation yields the removed
        // entry's successor
        inner.cursor = slot.prev.or(inner.tail);
    }
    if inner.index.is_empty() {
        inner.cursor = None;
    }
    inner.free.push(idx);
}
