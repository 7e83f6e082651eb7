// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster-wide identifier allocation.
//!
//! Identifiers are handed out by in-memory [`BlockAllocator`]s, one per
//! [`AllocationKey`], that reserve contiguous blocks from a durable
//! [`CounterStore`]. The store is the only state shared between processes;
//! because every block is reserved under an exclusive row lock, identifiers
//! are unique across the cluster while most allocations never leave the
//! process.
//!
//! Callers go through [`GuidManager`], which mints 64-bit [`Guid`]s for
//! design objects and 32-bit "next numbers" for named legacy sequences.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use id_alloc::{AllocConfig, AllocMetrics, GuidManager, ObjectType, SqliteCounterStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AllocConfig::default();
//! let store = SqliteCounterStore::open(Some("ids.db".as_ref()), config.seeds)?;
//! let manager = GuidManager::new(Arc::new(store), config, &AllocMetrics::noop())?;
//! let guid = manager.create_guid(ObjectType::Template)?;
//! let content_id = manager.create_id("CONTENT")?;
//! # Ok(())
//! # }
//! ```

mod block;
mod config;
mod error;
mod guid;
mod host;
mod key;
mod manager;
mod metrics;
mod registry;

pub mod store;

pub use crate::block::{BlockAllocator, Refill};
pub use crate::config::{
    AllocConfig, CounterSeeds, DEFAULT_LONG_ID_BLOCK_SIZE, DEFAULT_NEXT_NUMBER_BLOCK_SIZE,
    DEFAULT_NODE_NAME,
};
pub use crate::error::{AllocError, StoreError};
pub use crate::guid::Guid;
pub use crate::host::{generate_host_id, local_ip, HostIdentity, HostIp, MAX_HOST_ID};
pub use crate::key::{
    AllocationKey, NamedKey, ObjectType, TypedKey, MAX_REPOSITORY_ID, REPOSITORY_KEY_FACTOR,
};
pub use crate::manager::GuidManager;
pub use crate::metrics::AllocMetrics;
pub use crate::registry::AllocationRegistry;
pub use crate::store::{
    CounterStore, HostIdRecord, MemoryCounterStore, PostgresCounterStore, SqliteCounterStore,
};

/// A value drawn from a counter.
pub type Id = i64;
