// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable counter storage.
//!
//! A [`CounterStore`] is the cluster-wide source of truth for every counter's
//! high-water mark. Each counter row records the last identifier already
//! reserved; reserving a block reads the row under an exclusive lock,
//! advances it by the block size, and returns the first identifier of the
//! new block. Two independent namespaces exist: integer-keyed long-id
//! counters and string-keyed next-number counters.

use std::fmt::Debug;

use crate::config::CounterSeeds;
use crate::error::StoreError;
use crate::host::HostIp;
use crate::Id;

mod memory;
mod postgres;
mod sqlite;

pub use crate::store::memory::MemoryCounterStore;
pub use crate::store::postgres::PostgresCounterStore;
pub use crate::store::sqlite::SqliteCounterStore;

/// The table names shared by the SQL backends.
pub(crate) const LONG_ID_TABLE: &str = "id_alloc_long_id";
pub(crate) const NEXT_NUMBER_TABLE: &str = "id_alloc_next_number";
pub(crate) const HOST_IDENTITY_TABLE: &str = "id_alloc_host_identity";

/// A durable, transactional store of counters.
///
/// Every method is a single atomic unit: either all of its effects are
/// durable when it returns `Ok`, or none are.
pub trait CounterStore: Debug + Send + Sync {
    /// Reserves `block_size` identifiers from the long-id counter `key` and
    /// returns the first of them.
    ///
    /// The row is created with [`CounterSeeds::long_id`] if absent. When
    /// `override_minimum` is set the returned start is at least that value.
    /// A `block_size` of zero with no override only reads.
    fn advance_long_id(
        &self,
        key: i64,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError>;

    /// Like [`CounterStore::advance_long_id`], for the next-number counter
    /// named `key`, seeded with [`CounterSeeds::next_number`].
    fn advance_next_number(
        &self,
        key: &str,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError>;

    /// Returns the host id persisted for `node`, replacing it with
    /// `candidate` when no host id is stored or the stored address differs
    /// from `ip`.
    fn load_or_replace_host_id(
        &self,
        node: &str,
        ip: HostIp,
        candidate: u32,
    ) -> Result<HostIdRecord, StoreError>;
}

/// The outcome of [`CounterStore::load_or_replace_host_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIdRecord {
    pub host_id: u32,
    /// The address previously stored for the node, if any.
    pub previous_ip: Option<HostIp>,
    /// Whether `host_id` is the candidate that was just persisted.
    pub generated: bool,
}

/// The effect of one read-modify-write on a counter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Advance {
    /// The first identifier of the reserved block.
    pub start: Id,
    /// The value to persist, or `None` if the row is left untouched.
    pub stored: Option<Id>,
}

/// Computes the read-modify-write of a counter row whose current value is
/// `stored`. Shared by every backend so that they agree exactly.
pub(crate) fn advance(
    key: &dyn std::fmt::Display,
    stored: Id,
    block_size: i64,
    override_minimum: Option<Id>,
) -> Result<Advance, StoreError> {
    if stored < 0 {
        return Err(StoreError::corrupt(format!(
            "negative counter {} for key {}",
            stored, key
        )));
    }
    if block_size < 0 {
        return Err(format!("negative block size {} for key {}", block_size, key).into());
    }
    let base = match override_minimum {
        Some(minimum) => stored.max(minimum.saturating_sub(1)),
        None => stored,
    };
    let start = base
        .checked_add(1)
        .ok_or_else(|| StoreError::from(format!("counter for key {} is exhausted", key)))?;
    let persist = block_size > 0 || override_minimum.is_some();
    let stored = if persist {
        let next = base.checked_add(block_size).ok_or_else(|| {
            StoreError::from(format!(
                "counter for key {} cannot advance by {}",
                key, block_size
            ))
        })?;
        Some(next)
    } else {
        None
    };
    Ok(Advance { start, stored })
}

/// Rejects negative seeds before a backend starts creating rows with them.
pub(crate) fn checked_seeds(seeds: CounterSeeds) -> Result<CounterSeeds, StoreError> {
    for (name, seed) in [("long_id", seeds.long_id), ("next_number", seeds.next_number)] {
        if seed < 0 {
            return Err(format!("{} seed must not be negative: {}", name, seed).into());
        }
    }
    Ok(seeds)
}
