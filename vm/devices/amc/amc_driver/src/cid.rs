// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command identifier allocation.
//!
//! Identifiers are handed out cyclically, starting after the most recently
//! issued one, so a stale completion for a just-released identifier is
//! unlikely to match a new command.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Number of command identifiers in a pool.
pub const MAX_COMMAND_IDS: usize = 255;

/// Identifies the device instance that allocated a command identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Returns a process-unique owner.
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum CidError {
    #[error("all {0} command ids are in use")]
    Exhausted(usize),
    #[error("command id {0} is out of range")]
    OutOfRange(u16),
    #[error("command id {0} is not allocated")]
    NotAllocated(u16),
    #[error("command id {cid} belongs to {actual:?}, not {expected:?}")]
    OwnerMismatch {
        cid: u16,
        expected: OwnerId,
        actual: OwnerId,
    },
}

/// A pool of command identifiers.
#[derive(Debug)]
pub struct CidAllocator {
    state: Mutex<CidState>,
}

#[derive(Debug)]
struct CidState {
    slots: Vec<Option<OwnerId>>,
    last: usize,
    in_use: usize,
}

impl CidAllocator {
    /// Creates a pool of `capacity` identifiers, `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u16::MAX as usize + 1);
        Self {
            state: Mutex::new(CidState {
                slots: vec![None; capacity],
                last: capacity - 1,
                in_use: 0,
            }),
        }
    }

    /// The process-wide pool shared by every device that does not bring its
    /// own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<CidAllocator>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(Self::new(MAX_COMMAND_IDS)))
            .clone()
    }

    pub fn alloc(&self, owner: OwnerId) -> Result<u16, CidError> {
        let mut state = self.state.lock();
        let capacity = state.slots.len();
        let last = state.last;
        let slot = (1..=capacity)
            .map(|step| (last + step) % capacity)
            .find(|&i| state.slots[i].is_none())
            .ok_or(CidError::Exhausted(capacity))?;

        state.slots[slot] = Some(owner);
        state.last = slot;
        state.in_use += 1;
        Ok(slot as u16)
    }

    /// Returns `cid` to the pool. The identifier must be owned by `owner`.
    pub fn release(&self, cid: u16, owner: OwnerId) -> Result<(), CidError> {
        let mut state = self.state.lock();
        let current = state.slots.get(cid as usize).copied();
        let result = match current {
            None => Err(CidError::OutOfRange(cid)),
            Some(None) => Err(CidError::NotAllocated(cid)),
            Some(Some(actual)) if actual != owner => Err(CidError::OwnerMismatch {
                cid,
                expected: owner,
                actual,
            }),
            Some(Some(_)) => {
                state.slots[cid as usize] = None;
                state.in_use -= 1;
                Ok(())
            }
        };
        if let Err(err) = &result {
            tracing::error!(
                cid,
                error = err as &dyn std::error::Error,
                "failed to release command id"
            );
        }
        result
    }

    /// The number of identifiers currently allocated.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }
}

/// An allocated command identifier, released on drop.
#[derive(Debug)]
pub(crate) struct CidGuard<'a> {
    allocator: &'a CidAllocator,
    owner: OwnerId,
    cid: u16,
}

impl<'a> CidGuard<'a> {
    pub fn new(allocator: &'a CidAllocator, owner: OwnerId) -> Result<Self, CidError> {
        let cid = allocator.alloc(owner)?;
        Ok(Self {
            allocator,
            owner,
            cid,
        })
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }
}

impl Drop for CidGuard<'_> {
    fn drop(&mut self) {
        // Failures are logged by the allocator.
        let _ = self.allocator.release(self.cid, self.owner);
    }
}
