// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Fixed pool of batching-stage slots.
//!
//! Slots are handed out lowest-first and returned to the back of the free
//! list, so a just-released slot is the last one to be reused.

use batchkit_core::{BatchKitError, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of [`SlotPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquire {
    Acquired(usize),
    /// Every slot is in use; the caller backs off and retries.
    Blocked,
}

struct PoolInner {
    free: VecDeque<usize>,
    in_use: Vec<bool>,
}

pub struct SlotPool {
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: (0..capacity).collect(),
                in_use: vec![false; capacity],
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().in_use.len()
    }

    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Takes the first free slot. Never blocks.
    pub fn acquire(&self) -> SlotAcquire {
        let mut inner = self.lock();
        match inner.free.pop_front() {
            Some(slot) => {
                inner.in_use[slot] = true;
                SlotAcquire::Acquired(slot)
            },
            None => SlotAcquire::Blocked,
        }
    }

    /// Returns a slot to the back of the free list.
    ///
    /// # Errors
    ///
    /// Returns [`BatchKitError::SlotInvariant`] if the slot is out of range or
    /// not currently held.
    pub fn release(&self, slot: usize) -> Result<()> {
        let mut inner = self.lock();
        match inner.in_use.get(slot).copied() {
            None => Err(BatchKitError::SlotInvariant(format!(
                "slot {slot} is out of range (capacity {})",
                inner.in_use.len()
            ))),
            Some(false) => {
                Err(BatchKitError::SlotInvariant(format!("slot {slot} released twice")))
            },
            Some(true) => {
                inner.in_use[slot] = false;
                inner.free.push_back(slot);
                Ok(())
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
