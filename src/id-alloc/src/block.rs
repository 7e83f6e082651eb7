// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! In-memory cursors over blocks of reserved identifiers.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::validate_block_size;
use crate::error::{AllocError, StoreError};
use crate::Id;

/// Reserves new blocks of identifiers on behalf of a [`BlockAllocator`].
///
/// Implementations must guarantee that two calls, from this process or any
/// other sharing the same durable state, never return overlapping blocks.
pub trait Refill: Send + Sync {
    /// Reserves `block_size` identifiers and returns the first of them.
    ///
    /// When `override_minimum` is set, the returned block must start at or
    /// after it, and the durable counter must be advanced at least that far
    /// even when `block_size` is zero.
    fn refill(&self, block_size: i64, override_minimum: Option<Id>) -> Result<Id, StoreError>;
}

impl<F> Refill for F
where
    F: Fn(i64, Option<Id>) -> Result<Id, StoreError> + Send + Sync,
{
    fn refill(&self, block_size: i64, override_minimum: Option<Id>) -> Result<Id, StoreError> {
        (self)(block_size, override_minimum)
    }
}

/// Hands out a strictly increasing sequence of identifiers from blocks
/// reserved through a [`Refill`].
///
/// Every operation runs under a single allocator-wide lock. The critical
/// section is a handful of comparisons plus, when the block is exhausted, one
/// call to the refill strategy.
pub struct BlockAllocator {
    block_size: i64,
    inner: Mutex<BlockState>,
    refill: Arc<dyn Refill>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockState {
    /// The next identifier to hand out.
    next: Id,
    /// The last identifier of the current block, inclusive.
    last: Id,
}

impl BlockState {
    fn is_exhausted(&self) -> bool {
        self.last <= 0 || self.next > self.last
    }

    /// Reserves a new block and adopts it. On error `self` is left untouched.
    fn refill(
        &mut self,
        refill: &dyn Refill,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<(), StoreError> {
        let start = refill.refill(block_size, override_minimum)?;
        let last = start
            .checked_add(block_size - 1)
            .ok_or_else(|| StoreError::corrupt(format!("block starting at {} overflows", start)))?;
        self.next = start;
        self.last = last;
        Ok(())
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.inner.lock().expect("lock poisoned");
        f.debug_struct("BlockAllocator")
            .field("next", &state.next)
            .field("last", &state.last)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl BlockAllocator {
    /// Creates an allocator with an empty window that reserves `block_size`
    /// identifiers per refill. `block_size` must be positive.
    pub fn new(block_size: i64, refill: Arc<dyn Refill>) -> Result<BlockAllocator, AllocError> {
        validate_block_size("block size", block_size)?;
        Ok(BlockAllocator {
            block_size,
            inner: Mutex::new(BlockState { next: 0, last: 0 }),
            refill,
        })
    }

    /// The number of identifiers reserved per refill.
    pub fn block_size(&self) -> i64 {
        self.block_size
    }

    /// Returns the next identifier, refilling first if the current block is
    /// exhausted.
    ///
    /// Refill errors propagate unchanged and leave the allocator as it was,
    /// so the call may be retried.
    pub fn next(&self) -> Result<Id, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if state.is_exhausted() {
            state.refill(&*self.refill, self.block_size, None)?;
        }
        let id = state.next;
        state.next = id
            .checked_add(1)
            .ok_or_else(|| StoreError::corrupt(format!("identifier {} overflows", id)))?;
        Ok(id)
    }

    /// Returns the identifier the next call to [`BlockAllocator::next`] would
    /// return, without consuming it.
    pub fn peek(&self) -> Result<Id, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if state.is_exhausted() {
            state.refill(&*self.refill, self.block_size, None)?;
        }
        Ok(state.next)
    }

    /// Ensures every future identifier is at least `value` and returns the
    /// cursor that was in effect before the call.
    ///
    /// A `value` below the cursor is raised to the cursor, so nothing already
    /// handed out is ever handed out again. The refill strategy is always
    /// consulted with the adjusted target so that the durable counter
    /// survives a restart at or beyond it.
    pub fn fix(&self, value: Id) -> Result<Id, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        let original_next = state.next;
        let target = value.max(state.next);
        let override_minimum = (target > 0).then_some(target);

        if !state.is_exhausted() && target <= state.last {
            // The current block already covers the target. Only the durable
            // floor needs raising.
            self.refill.refill(0, override_minimum)?;
            state.next = target;
        } else {
            state.refill(&*self.refill, self.block_size, override_minimum)?;
        }
        Ok(original_next)
    }

    /// Overrides the in-memory window to `[next, last]`.
    ///
    /// Both bounds are replaced under the allocator lock, `next` first, so no
    /// caller ever observes a window whose upper bound was raised before its
    /// cursor. Administrative use only: the durable counter is not consulted.
    pub fn set_ids(&self, next: Id, last: Id) {
        let mut state = self.inner.lock().expect("lock poisoned");
        state.next = next;
        state.last = last;
    }

    /// The current `(next, last)` window.
    pub fn window(&self) -> (Id, Id) {
        let state = self.inner.lock().expect("lock poisoned");
        (state.next, state.last)
    }
}
