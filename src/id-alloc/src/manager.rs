// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The identifier allocation facade.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::block::{BlockAllocator, Refill};
use crate::config::{validate_block_size, AllocConfig};
use crate::error::{AllocError, StoreError};
use crate::guid::Guid;
use crate::host::HostIdentity;
use crate::key::{AllocationKey, NamedKey, ObjectType, TypedKey};
use crate::metrics::{AllocMetrics, NamespaceMetrics};
use crate::registry::AllocationRegistry;
use crate::store::CounterStore;
use crate::Id;

/// Refills long-id blocks from a [`CounterStore`].
struct LongIdRefill {
    store: Arc<dyn CounterStore>,
    key: i64,
    metrics: NamespaceMetrics,
}

impl Refill for LongIdRefill {
    fn refill(&self, block_size: i64, override_minimum: Option<Id>) -> Result<Id, StoreError> {
        let start = self.metrics.refill(|| {
            self.store
                .advance_long_id(self.key, block_size, override_minimum)
        })?;
        debug!(
            key = self.key,
            block_size,
            ?override_minimum,
            start,
            "refilled long id block"
        );
        Ok(start)
    }
}

/// Refills next-number blocks from a [`CounterStore`].
struct NextNumberRefill {
    store: Arc<dyn CounterStore>,
    key: NamedKey,
    metrics: NamespaceMetrics,
}

impl Refill for NextNumberRefill {
    fn refill(&self, block_size: i64, override_minimum: Option<Id>) -> Result<Id, StoreError> {
        let start = self.metrics.refill(|| {
            self.store
                .advance_next_number(self.key.as_str(), block_size, override_minimum)
        })?;
        debug!(
            key = %self.key,
            block_size,
            ?override_minimum,
            start,
            "refilled next number block"
        );
        Ok(start)
    }
}

/// Mints GUIDs and legacy next numbers.
///
/// A `GuidManager` owns one [`AllocationRegistry`] and the host identity of
/// this process. Create one per counter store and share it, e.g. behind an
/// [`Arc`], between every thread that allocates identifiers. All methods
/// validate their arguments before touching any allocator, and every store
/// failure is returned to the caller; no identifier is ever handed out that
/// the store has not reserved.
pub struct GuidManager {
    store: Arc<dyn CounterStore>,
    config: AllocConfig,
    registry: AllocationRegistry,
    host: HostIdentity,
    long_id_metrics: NamespaceMetrics,
    next_number_metrics: NamespaceMetrics,
}

impl fmt::Debug for GuidManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidManager")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl GuidManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: AllocConfig,
        metrics: &AllocMetrics,
    ) -> Result<GuidManager, AllocError> {
        config.validate()?;
        let host = HostIdentity::new(config.node_name.clone());
        Ok(GuidManager {
            store,
            registry: AllocationRegistry::new(),
            host,
            long_id_metrics: metrics.namespace("long_id"),
            next_number_metrics: metrics.namespace("next_number"),
            config,
        })
    }

    /// Replaces the host identity, e.g. to pin the address it resolves.
    pub fn with_host_identity(mut self, host: HostIdentity) -> GuidManager {
        self.host = host;
        self
    }

    pub fn config(&self) -> &AllocConfig {
        &self.config
    }

    /// Mints a GUID for an object of type `object_type`.
    pub fn create_guid(&self, object_type: ObjectType) -> Result<Guid, AllocError> {
        self.create_guid_for_key(TypedKey::new(object_type))
    }

    /// Mints a GUID for an object of type `object_type` from the uuid
    /// sequence private to repository `repository_id`.
    pub fn create_guid_in_repository(
        &self,
        repository_id: i32,
        object_type: ObjectType,
    ) -> Result<Guid, AllocError> {
        self.create_guid_for_key(TypedKey::in_repository(repository_id, object_type)?)
    }

    fn create_guid_for_key(&self, key: TypedKey) -> Result<Guid, AllocError> {
        let host_id = self.host_id()?;
        let allocation_key = AllocationKey::from(key);
        let value = self.allocator(&allocation_key)?.next()?;
        let uuid = u32::try_from(value).map_err(|_| AllocError::Exhausted {
            key: allocation_key.to_string(),
            value,
        })?;
        let guid = Guid::new(host_id, key.object_type(), uuid)?;
        self.long_id_metrics.ids_allocated.inc();
        Ok(guid)
    }

    /// Returns the next number of the sequence named `key`.
    pub fn create_id(&self, key: &str) -> Result<i32, AllocError> {
        let key = AllocationKey::from(NamedKey::new(key)?);
        let value = self.allocator(&key)?.next()?;
        let id = narrow(&key, value)?;
        self.next_number_metrics.ids_allocated.inc();
        Ok(id)
    }

    /// Reserves `block_size` consecutive numbers of the sequence named `key`
    /// in a single store transaction and returns them in ascending order.
    ///
    /// The block is reserved directly from the store, so it is disjoint from
    /// every number handed out by [`GuidManager::create_id`] in this or any
    /// other process.
    pub fn create_id_block(&self, key: &str, block_size: i64) -> Result<Vec<i32>, AllocError> {
        validate_block_size("block size", block_size)?;
        let named = NamedKey::new(key)?;
        let start = self.next_number_metrics.refill(|| {
            self.store
                .advance_next_number(named.as_str(), block_size, None)
        })?;
        let key = AllocationKey::from(named);
        let first = narrow(&key, start)?;
        // The store has already persisted `start + block_size - 1`, so this
        // cannot overflow.
        let last = narrow(&key, start + (block_size - 1))?;
        debug!(%key, first, last, "reserved id block");
        self.next_number_metrics
            .ids_allocated
            .inc_by(u64::try_from(block_size).unwrap_or_default());
        Ok((first..=last).collect())
    }

    /// Returns the number the next call to [`GuidManager::create_id`] for
    /// `key` would return, without consuming it.
    ///
    /// If this process has not allocated from `key` yet, the store is read
    /// without reserving anything.
    pub fn peek_next_number(&self, key: &str) -> Result<i32, AllocError> {
        let named = NamedKey::new(key)?;
        let key = AllocationKey::from(named.clone());
        let value = match self.registry.get(&key) {
            Some(allocator) => allocator.peek()?,
            None => self
                .next_number_metrics
                .refill(|| self.store.advance_next_number(named.as_str(), 0, None))?,
        };
        narrow(&key, value)
    }

    /// Ensures every future number of the sequence named `key` is at least
    /// `value`, in this process and, through the store, in every other.
    ///
    /// Returns the cursor of this process's allocator for `key` as it was
    /// before the call. For an allocator that has not handed anything out yet
    /// that cursor is `0`.
    pub fn fix_next_number(&self, key: &str, value: i32) -> Result<i32, AllocError> {
        let key = AllocationKey::from(NamedKey::new(key)?);
        let original = self.allocator(&key)?.fix(Id::from(value))?;
        narrow(&key, original)
    }

    /// The 24-bit host id folded into every GUID minted by this process.
    pub fn host_id(&self) -> Result<u32, AllocError> {
        Ok(self.host.host_id(&*self.store)?)
    }

    fn allocator(&self, key: &AllocationKey) -> Result<Arc<BlockAllocator>, AllocError> {
        let block_size = match key {
            AllocationKey::Typed(_) => self.config.long_id_block_size,
            AllocationKey::Named(_) => self.config.next_number_block_size,
        };
        self.registry.get_or_create(key, block_size, || {
            let refill: Arc<dyn Refill> = match key {
                AllocationKey::Typed(typed) => Arc::new(LongIdRefill {
                    store: Arc::clone(&self.store),
                    key: typed.value(),
                    metrics: self.long_id_metrics.clone(),
                }),
                AllocationKey::Named(named) => Arc::new(NextNumberRefill {
                    store: Arc::clone(&self.store),
                    key: named.clone(),
                    metrics: self.next_number_metrics.clone(),
                }),
            };
            refill
        })
    }
}

/// Narrows a next number to the 32 bits legacy callers store it in.
fn narrow(key: &AllocationKey, value: Id) -> Result<i32, AllocError> {
    i32::try_from(value).map_err(|_| AllocError::Exhausted {
        key: key.to_string(),
        value,
    })
}
