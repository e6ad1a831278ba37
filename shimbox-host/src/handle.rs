//! Handle allocation for virtual keys
//!
//! Handles are small integers handed to the guest in place of native key
//! handles. The allocator hands out the lowest released handle first and
//! otherwise counts upward through its range.
//!
//! The allocator never calls back into its owner while holding its own
//! lock, so an owner may call [`HandleAllocator::next`] while it holds its
//! own write lock and passes the locked table as the [`HandleUser`].

use parking_lot::Mutex;
use shimbox_api::KeyHandle;
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Liveness check the allocator consults before issuing a handle
pub trait HandleUser {
    /// Whether `handle` is currently bound to something live
    fn is_used_handle(&self, handle: KeyHandle) -> bool;
}

/// Errors raised by the allocator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("No free handle left in range {first}..={last}")]
    Exhausted { first: KeyHandle, last: KeyHandle },
}

/// Issues unique, reusable handles within a fixed range
#[derive(Debug)]
pub struct HandleAllocator {
    first: KeyHandle,
    last: KeyHandle,
    state: Mutex<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    /// Next never-issued handle; u64 so the counter can step past `u32::MAX`
    next_fresh: u64,
    released: BTreeSet<KeyHandle>,
    assigned: HashSet<KeyHandle>,
}

impl HandleAllocator {
    /// Allocator over `1..=u32::MAX`
    pub fn new() -> Self {
        Self::with_range(1, KeyHandle::MAX)
    }

    /// Allocator over `first..=last`; a `first` of 0 is raised to 1
    pub fn with_range(first: KeyHandle, last: KeyHandle) -> Self {
        let first = first.max(1);
        Self {
            first,
            last: last.max(first),
            state: Mutex::new(AllocatorState {
                next_fresh: first as u64,
                released: BTreeSet::new(),
                assigned: HashSet::new(),
            }),
        }
    }

    /// First handle of the range
    pub fn first(&self) -> KeyHandle {
        self.first
    }

    /// Last handle of the range
    pub fn last(&self) -> KeyHandle {
        self.last
    }

    /// Issue a handle that is neither assigned here nor in use by `owner`
    pub fn next(&self, owner: &dyn HandleUser) -> Result<KeyHandle, HandleError> {
        loop {
            let candidate = self.claim_candidate()?;
            if !owner.is_used_handle(candidate) {
                tracing::trace!(handle = candidate, "Handle issued");
                return Ok(candidate);
            }
            // Owner already holds it (externally reserved); leave it marked
            // assigned so the owner's eventual release frees it.
            tracing::debug!(handle = candidate, "Skipping handle still in use by owner");
        }
    }

    /// Free `handle` for reuse; freeing an unassigned handle is a no-op
    pub fn release(&self, handle: KeyHandle) {
        let mut state = self.state.lock();
        if state.assigned.remove(&handle) {
            state.released.insert(handle);
            tracing::trace!(handle, "Handle released");
        }
    }

    /// Mark an externally chosen handle as assigned
    ///
    /// Returns `false` if the handle is outside the range or already assigned.
    pub fn reserve(&self, handle: KeyHandle) -> bool {
        if handle < self.first || handle > self.last {
            return false;
        }
        let mut state = self.state.lock();
        if !state.assigned.insert(handle) {
            return false;
        }
        state.released.remove(&handle);
        true
    }

    /// Whether `handle` is currently assigned by this allocator
    pub fn is_assigned(&self, handle: KeyHandle) -> bool {
        self.state.lock().assigned.contains(&handle)
    }

    /// Number of currently assigned handles
    pub fn assigned_count(&self) -> usize {
        self.state.lock().assigned.len()
    }

    fn claim_candidate(&self) -> Result<KeyHandle, HandleError> {
        let mut state = self.state.lock();

        while let Some(handle) = state.released.pop_first() {
            if state.assigned.insert(handle) {
                return Ok(handle);
            }
        }

        while state.next_fresh <= self.last as u64 {
            let handle = state.next_fresh as KeyHandle;
            state.next_fresh += 1;
            if state.assigned.insert(handle) {
                return Ok(handle);
            }
        }

        Err(HandleError::Exhausted {
            first: self.first,
            last: self.last,
        })
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
