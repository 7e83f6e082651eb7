// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::config::CounterSeeds;
use crate::error::StoreError;
use crate::host::HostIp;
use crate::store::{advance, checked_seeds, CounterStore, HostIdRecord};
use crate::Id;

/// A [`CounterStore`] held entirely in process memory.
///
/// A single mutex stands in for the row locks of the SQL backends, so every
/// read-modify-write is linearized. Nothing survives the process; this store
/// is meant for tests and for embedding where no other process allocates.
#[derive(Debug)]
pub struct MemoryCounterStore {
    seeds: CounterSeeds,
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    long_ids: BTreeMap<i64, Id>,
    next_numbers: BTreeMap<String, Id>,
    hosts: BTreeMap<String, (u32, HostIp)>,
    /// When set, the next counter operation fails with this message.
    fail_next: Option<String>,
}

impl MemoryCounterStore {
    pub fn new(seeds: CounterSeeds) -> Result<MemoryCounterStore, StoreError> {
        Ok(MemoryCounterStore {
            seeds: checked_seeds(seeds)?,
            inner: Mutex::new(MemoryState::default()),
        })
    }

    /// Makes the next counter operation fail with `msg` without changing any
    /// state, as a lost connection would.
    pub fn fail_next(&self, msg: impl Into<String>) {
        self.inner.lock().expect("lock poisoned").fail_next = Some(msg.into());
    }

    /// The stored value of long-id counter `key`, if the row exists.
    pub fn long_id(&self, key: i64) -> Option<Id> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .long_ids
            .get(&key)
            .copied()
    }

    /// The stored value of next-number counter `key`, if the row exists.
    pub fn next_number(&self, key: &str) -> Option<Id> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .next_numbers
            .get(key)
            .copied()
    }
}

fn advance_entry(
    key: &dyn std::fmt::Display,
    stored: &mut Id,
    block_size: i64,
    override_minimum: Option<Id>,
) -> Result<Id, StoreError> {
    let advance = advance(key, *stored, block_size, override_minimum)?;
    if let Some(next) = advance.stored {
        *stored = next;
    }
    debug!(%key, block_size, ?override_minimum, start = advance.start, "advanced counter");
    Ok(advance.start)
}

impl CounterStore for MemoryCounterStore {
    fn advance_long_id(
        &self,
        key: i64,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if let Some(msg) = state.fail_next.take() {
            return Err(msg.into());
        }
        let mut stored = *state.long_ids.get(&key).unwrap_or(&self.seeds.long_id);
        let start = advance_entry(&key, &mut stored, block_size, override_minimum)?;
        state.long_ids.insert(key, stored);
        Ok(start)
    }

    fn advance_next_number(
        &self,
        key: &str,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if let Some(msg) = state.fail_next.take() {
            return Err(msg.into());
        }
        let mut stored = *state
            .next_numbers
            .get(key)
            .unwrap_or(&self.seeds.next_number);
        let start = advance_entry(&key, &mut stored, block_size, override_minimum)?;
        state.next_numbers.insert(key.to_string(), stored);
        Ok(start)
    }

    fn load_or_replace_host_id(
        &self,
        node: &str,
        ip: HostIp,
        candidate: u32,
    ) -> Result<HostIdRecord, StoreError> {
        let mut state = self.inner.lock().expect("lock poisoned");
        if let Some(msg) = state.fail_next.take() {
            return Err(msg.into());
        }
        let previous = state.hosts.get(node).copied();
        match previous {
            Some((host_id, stored_ip)) if stored_ip == ip => Ok(HostIdRecord {
                host_id,
                previous_ip: Some(stored_ip),
                generated: false,
            }),
            _ => {
                state.hosts.insert(node.to_string(), (candidate, ip));
                Ok(HostIdRecord {
                    host_id: candidate,
                    previous_ip: previous.map(|(_, ip)| ip),
                    generated: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryCounterStore {
        MemoryCounterStore::new(CounterSeeds {
            long_id: 0,
            next_number: 100,
        })
        .unwrap()
    }

    #[test]
    fn test_seeds_and_advance() {
        let store = store();
        assert_eq!(store.advance_long_id(7, 10, None).unwrap(), 1);
        assert_eq!(store.advance_long_id(7, 10, None).unwrap(), 11);
        assert_eq!(store.long_id(7), Some(20));

        assert_eq!(store.advance_next_number("CONTENT", 1, None).unwrap(), 101);
        assert_eq!(store.advance_next_number("CONTENT", 1, None).unwrap(), 102);
        assert_eq!(store.next_number("CONTENT"), Some(102));
        assert_eq!(store.long_id(8), None);
    }

    #[test]
    fn test_read_only_peek_creates_row() {
        let store = store();
        assert_eq!(store.advance_next_number("X", 0, None).unwrap(), 101);
        assert_eq!(store.advance_next_number("X", 0, None).unwrap(), 101);
        assert_eq!(store.next_number("X"), Some(100));
    }

    #[test]
    fn test_failure_changes_nothing() {
        let store = store();
        store.advance_long_id(1, 5, None).unwrap();
        store.fail_next("connection reset");
        let err = store.advance_long_id(1, 5, None).unwrap_err();
        assert_eq!(err.to_string(), "counter store error: connection reset");
        assert_eq!(store.long_id(1), Some(5));
        assert_eq!(store.advance_long_id(1, 5, None).unwrap(), 6);
    }

    #[test]
    fn test_negative_seed_rejected() {
        let err = MemoryCounterStore::new(CounterSeeds {
            long_id: -1,
            next_number: 0,
        })
        .unwrap_err();
        assert!(err.to_string().contains("long_id seed must not be negative"));
    }

    #[test]
    fn test_host_id_replaced_on_ip_change() {
        let store = store();
        let a = HostIp::from(std::net::Ipv4Addr::new(10, 0, 0, 1));
        let b = HostIp::from(std::net::Ipv4Addr::new(10, 0, 0, 2));

        let first = store.load_or_replace_host_id("node", a, 17).unwrap();
        assert_eq!((first.host_id, first.generated, first.previous_ip), (17, true, None));

        let again = store.load_or_replace_host_id("node", a, 99).unwrap();
        assert_eq!((again.host_id, again.generated), (17, false));

        let moved = store.load_or_replace_host_id("node", b, 42).unwrap();
        assert_eq!((moved.host_id, moved.generated, moved.previous_ip), (42, true, Some(a)));

        let other = store.load_or_replace_host_id("other", b, 5).unwrap();
        assert_eq!(other.host_id, 5);
    }
}
