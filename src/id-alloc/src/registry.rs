// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::block::{BlockAllocator, Refill};
use crate::error::AllocError;
use crate::key::AllocationKey;

/// Maps allocation keys to their allocators.
///
/// Allocators are created lazily, at most once per key for the lifetime of
/// the registry. One registry is expected per counter store; two registries
/// over the same store remain correct (the store never hands out overlapping
/// blocks) but each reserves its own blocks.
///
/// The block size of a key is fixed by the first call that creates its
/// allocator. Later requests with a different size receive the existing
/// allocator unchanged.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    allocators: Mutex<BTreeMap<AllocationKey, Arc<BlockAllocator>>>,
}

impl AllocationRegistry {
    pub fn new() -> AllocationRegistry {
        AllocationRegistry::default()
    }

    /// Returns the allocator for `key`, creating it with `block_size` and the
    /// strategy built by `make_refill` if none exists yet.
    ///
    /// `make_refill` runs at most once per key and only while the registry
    /// lock is held, so it must not call back into the registry. A
    /// non-positive `block_size` is rejected before any allocator is created.
    pub fn get_or_create<F>(
        &self,
        key: &AllocationKey,
        block_size: i64,
        make_refill: F,
    ) -> Result<Arc<BlockAllocator>, AllocError>
    where
        F: FnOnce() -> Arc<dyn Refill>,
    {
        let mut allocators = self.allocators.lock().expect("lock poisoned");
        if let Some(allocator) = allocators.get(key) {
            let existing = allocator.block_size();
            if existing != block_size {
                warn!(
                    %key,
                    existing, requested = block_size, "ignoring block size change for allocator"
                );
            }
            return Ok(Arc::clone(allocator));
        }
        debug!(%key, block_size, "creating allocator");
        let allocator = Arc::new(BlockAllocator::new(block_size, make_refill())?);
        allocators.insert(key.clone(), Arc::clone(&allocator));
        Ok(allocator)
    }

    /// Returns the allocator for `key`, if one has been created.
    pub fn get(&self, key: &AllocationKey) -> Option<Arc<BlockAllocator>> {
        self.allocators
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(Arc::clone)
    }

    /// The keys with live allocators, in key order.
    pub fn keys(&self) -> Vec<AllocationKey> {
        self.allocators
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::StoreError;
    use crate::key::{NamedKey, ObjectType, TypedKey};
    use crate::Id;

    use super::*;

    fn counting_refill(created: &AtomicUsize) -> Arc<dyn Refill> {
        created.fetch_add(1, Ordering::SeqCst);
        let stored = Arc::new(Mutex::new(0i64));
        Arc::new(
            move |block_size: i64, _: Option<Id>| -> Result<Id, StoreError> {
                let mut stored = stored.lock().unwrap();
                let start = *stored + 1;
                *stored += block_size;
                Ok(start)
            },
        )
    }

    #[test]
    fn test_concurrent_get_or_create() {
        const THREADS: usize = 50;

        let registry = AllocationRegistry::new();
        let created = AtomicUsize::new(0);
        let key = AllocationKey::from(NamedKey::new("foo").unwrap());

        let allocators: Vec<Arc<BlockAllocator>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        registry
                            .get_or_create(&key, 5, || counting_refill(&created))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(allocators.len(), THREADS);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        for allocator in &allocators {
            assert!(Arc::ptr_eq(allocator, &allocators[0]));
        }
        assert_eq!(registry.keys(), vec![key]);
    }

    #[test]
    fn test_block_size_fixed_at_creation() {
        let registry = AllocationRegistry::new();
        let created = AtomicUsize::new(0);
        let key = AllocationKey::from(TypedKey::new(ObjectType::Slot));

        let first = registry
            .get_or_create(&key, 5, || counting_refill(&created))
            .unwrap();
        let second = registry
            .get_or_create(&key, 50, || counting_refill(&created))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.block_size(), 5);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = AllocationRegistry::new();
        let created = AtomicUsize::new(0);
        let typed = AllocationKey::from(TypedKey::new(ObjectType::Slot));
        let salted = AllocationKey::from(TypedKey::in_repository(1, ObjectType::Slot).unwrap());
        let named = AllocationKey::from(NamedKey::new("slot").unwrap());

        for key in [&typed, &salted, &named] {
            registry
                .get_or_create(key, 3, || counting_refill(&created))
                .unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert!(registry.get(&typed).is_some());
        assert!(registry
            .get(&AllocationKey::from(NamedKey::new("other").unwrap()))
            .is_none());

        assert_eq!(registry.get(&typed).unwrap().next().unwrap(), 1);
        assert_eq!(registry.get(&salted).unwrap().next().unwrap(), 1);
        assert_eq!(registry.get(&typed).unwrap().next().unwrap(), 2);
    }

    #[test]
    fn test_invalid_block_size_creates_nothing() {
        let registry = AllocationRegistry::new();
        let created = AtomicUsize::new(0);
        let key = AllocationKey::from(NamedKey::new("foo").unwrap());
        for block_size in [0, -1] {
            assert!(matches!(
                registry.get_or_create(&key, block_size, || counting_refill(&created)),
                Err(AllocError::InvalidArgument(_))
            ));
        }
        assert!(registry.get(&key).is_none());
        assert!(registry.keys().is_empty());
    }
}
