// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tempfile::NamedTempFile;

use id_alloc::{
    AllocConfig, AllocMetrics, CounterSeeds, CounterStore, GuidManager, HostIdentity, HostIp,
    MemoryCounterStore, ObjectType, PostgresCounterStore, SqliteCounterStore,
};

#[test]
fn test_store_memory() -> Result<(), anyhow::Error> {
    test_counters(&MemoryCounterStore::new(CounterSeeds::default())?)?;
    test_host_ids(&MemoryCounterStore::new(CounterSeeds::default())?)?;
    Ok(())
}

#[test]
fn test_store_sqlite() -> Result<(), anyhow::Error> {
    {
        let file = NamedTempFile::new()?;
        test_counters(&SqliteCounterStore::open(
            Some(file.path()),
            CounterSeeds::default(),
        )?)?;
    }
    {
        let file = NamedTempFile::new()?;
        test_host_ids(&SqliteCounterStore::open(
            Some(file.path()),
            CounterSeeds::default(),
        )?)?;
    }
    {
        let file = NamedTempFile::new()?;
        test_shared(|| SqliteCounterStore::open(Some(file.path()), CounterSeeds::default()))?;
    }
    {
        let file = NamedTempFile::new()?;
        test_block_boundaries(|seeds| SqliteCounterStore::open(Some(file.path()), seeds))?;
    }
    Ok(())
}

#[test]
fn test_store_sqlite_reopen() -> Result<(), anyhow::Error> {
    let file = NamedTempFile::new()?;
    let (host_id, last) = {
        let store = SqliteCounterStore::open(Some(file.path()), CounterSeeds::default())?;
        let manager = manager(store, AllocConfig::default())?;
        let mut last = 0;
        for _ in 0..3 {
            last = manager.create_id("CONTENT")?;
        }
        (manager.host_id()?, last)
    };
    assert_eq!(last, 103);

    // Seeds only apply to rows that do not exist yet.
    let seeds = CounterSeeds {
        long_id: 0,
        next_number: 0,
    };
    let store = SqliteCounterStore::open(Some(file.path()), seeds)?;
    let manager = manager(store, AllocConfig::default())?;
    assert_eq!(manager.create_id("CONTENT")?, 104);
    assert_eq!(manager.create_id("OTHER")?, 1);
    assert_eq!(manager.host_id()?, host_id);
    Ok(())
}

#[test]
fn test_store_postgres() -> Result<(), anyhow::Error> {
    {
        // Verify invalid URLs fail on connect.
        assert!(
            PostgresCounterStore::connect("host=invalid", CounterSeeds::default())
                .unwrap_err()
                .to_string()
                .contains("counter store error: error connecting to server")
        );
    }

    let connstr = match std::env::var("POSTGRES_URL") {
        Ok(s) => s,
        Err(_) => {
            println!("skipping test_store_postgres because POSTGRES_URL is not set");
            return Ok(());
        }
    };
    fn connect(
        connstr: &str,
        seeds: CounterSeeds,
        clear: bool,
    ) -> Result<PostgresCounterStore, anyhow::Error> {
        if clear {
            let mut client = postgres::Client::connect(connstr, postgres::NoTls)?;
            client.batch_execute(
                "
                DROP TABLE IF EXISTS id_alloc_long_id;
                DROP TABLE IF EXISTS id_alloc_next_number;
                DROP TABLE IF EXISTS id_alloc_host_identity;
                ",
            )?;
        }
        Ok(PostgresCounterStore::connect(connstr, seeds)?)
    }
    {
        let store = connect(&connstr, CounterSeeds::default(), true)?;
        test_counters(&store)?;
    }
    {
        let store = connect(&connstr, CounterSeeds::default(), true)?;
        test_host_ids(&store)?;
    }
    {
        connect(&connstr, CounterSeeds::default(), true)?;
        test_shared(|| connect(&connstr, CounterSeeds::default(), false))?;
    }
    {
        connect(&connstr, CounterSeeds::default(), true)?;
        test_block_boundaries(|seeds| connect(&connstr, seeds, false))?;
    }
    {
        // A lost connection is not re-established; a new store is needed.
        let store = connect(&connstr, CounterSeeds::default(), true)?;
        assert_eq!(store.advance_next_number("CONTENT", 1, None)?, 101);
        let mut admin = postgres::Client::connect(&connstr, postgres::NoTls)?;
        admin.batch_execute(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity
             WHERE pid <> pg_backend_pid() AND datname = current_database()",
        )?;
        assert!(store.advance_next_number("CONTENT", 1, None).is_err());
        assert!(store.advance_next_number("CONTENT", 1, None).is_err());
        let store = connect(&connstr, CounterSeeds::default(), false)?;
        assert_eq!(store.advance_next_number("CONTENT", 1, None)?, 102);
    }
    Ok(())
}

fn manager<S>(store: S, config: AllocConfig) -> Result<GuidManager, anyhow::Error>
where
    S: CounterStore + 'static,
{
    fn resolve() -> io::Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }
    let node = config.node_name.clone();
    let manager = GuidManager::new(Arc::new(store), config, &AllocMetrics::noop())?;
    Ok(manager.with_host_identity(HostIdentity::with_resolver(node, resolve)))
}

/// Exercises a store whose tables are empty and whose seeds are the defaults.
fn test_counters(store: &dyn CounterStore) -> Result<(), anyhow::Error> {
    // Rows are created with the seed, which is the last value reserved.
    assert_eq!(store.advance_long_id(6, 20, None)?, 2);
    assert_eq!(store.advance_long_id(6, 20, None)?, 22);
    assert_eq!(store.advance_long_id(3006, 20, None)?, 2);

    // A zero-sized block with no override only reads.
    assert_eq!(store.advance_long_id(7, 0, None)?, 2);
    assert_eq!(store.advance_long_id(7, 0, None)?, 2);
    assert_eq!(store.advance_long_id(7, 1, None)?, 2);

    assert_eq!(store.advance_next_number("CONTENT", 1, None)?, 101);
    assert_eq!(store.advance_next_number("CONTENT", 0, None)?, 102);
    // An override raises the floor even without a reservation.
    assert_eq!(store.advance_next_number("CONTENT", 0, Some(500))?, 500);
    assert_eq!(store.advance_next_number("CONTENT", 1, None)?, 500);
    // An override below the stored value never lowers it.
    assert_eq!(store.advance_next_number("CONTENT", 1, Some(3))?, 501);
    assert_eq!(store.advance_next_number("content", 1, None)?, 101);

    // Negative block sizes are rejected without changing anything.
    assert!(store.advance_next_number("CONTENT", -1, None).is_err());
    assert_eq!(store.advance_next_number("CONTENT", 1, None)?, 502);
    Ok(())
}

fn test_host_ids(store: &dyn CounterStore) -> Result<(), anyhow::Error> {
    let ip = HostIp::from(Ipv4Addr::new(10, 0, 0, 1));
    let moved = HostIp::from("2001:db8::7".parse::<Ipv6Addr>()?);

    let record = store.load_or_replace_host_id("a", ip, 5)?;
    assert_eq!(record.host_id, 5);
    assert!(record.generated);
    assert_eq!(record.previous_ip, None);

    // Same address: the stored id wins over the new candidate.
    let record = store.load_or_replace_host_id("a", ip, 9)?;
    assert_eq!(record.host_id, 5);
    assert!(!record.generated);

    // Moved host: the candidate replaces the stored id.
    let record = store.load_or_replace_host_id("a", moved, 9)?;
    assert_eq!(record.host_id, 9);
    assert!(record.generated);
    assert_eq!(record.previous_ip, Some(ip));
    assert_eq!(store.load_or_replace_host_id("a", moved, 11)?.host_id, 9);

    // Nodes are independent.
    assert_eq!(store.load_or_replace_host_id("b", ip, 11)?.host_id, 11);
    assert_eq!(store.load_or_replace_host_id("a", moved, 12)?.host_id, 9);
    Ok(())
}

/// Two stores opened by `open` model two processes sharing durable state.
fn test_shared<F, S, E>(open: F) -> Result<(), anyhow::Error>
where
    F: Fn() -> Result<S, E>,
    S: CounterStore + 'static,
    E: Into<anyhow::Error>,
{
    let config = AllocConfig {
        long_id_block_size: 3,
        next_number_block_size: 2,
        ..Default::default()
    };
    let a = manager(open().map_err(Into::into)?, config.clone())?;
    let b = manager(open().map_err(Into::into)?, config)?;

    let (guids, numbers) = std::thread::scope(|s| {
        let handles: Vec<_> = [&a, &b, &a, &b]
            .into_iter()
            .map(|manager| {
                s.spawn(move || -> Result<_, anyhow::Error> {
                    let mut guids = Vec::new();
                    let mut numbers = Vec::new();
                    for _ in 0..50 {
                        guids.push(manager.create_guid(ObjectType::Folder)?.uuid());
                        numbers.push(manager.create_id("CONTENT")?);
                    }
                    Ok((guids, numbers))
                })
            })
            .collect();
        let mut all_guids = Vec::new();
        let mut all_numbers = Vec::new();
        for handle in handles {
            let (guids, numbers) = handle.join().expect("thread panicked")?;
            all_guids.extend(guids);
            all_numbers.extend(numbers);
        }
        Ok::<_, anyhow::Error>((all_guids, all_numbers))
    })?;

    let unique: BTreeSet<_> = guids.iter().collect();
    assert_eq!(unique.len(), 200);
    let unique: BTreeSet<_> = numbers.iter().collect();
    assert_eq!(unique.len(), 200);

    // Both processes derive the same host id for the same node and address.
    assert_eq!(a.host_id()?, b.host_id()?);

    // A block reserved by one process is never handed out by the other.
    let block = a.create_id_block("CONTENT", 10)?;
    for _ in 0..20 {
        let id = b.create_id("CONTENT")?;
        assert!(!block.contains(&id));
        assert!(!numbers.contains(&id));
    }

    // A fix in one process is honored by the other's next refill.
    let floor = b.peek_next_number("CONTENT")? + 1000;
    a.fix_next_number("CONTENT", floor)?;
    assert!(a.create_id("CONTENT")? >= floor);
    let mut from_b = Vec::new();
    for _ in 0..3 {
        from_b.push(b.create_id("CONTENT")?);
    }
    assert!(from_b.iter().any(|id| *id >= floor));
    Ok(())
}

/// Allocation from an empty store seeded at zero: the first block starts at 1
/// and the eleventh id triggers the second refill.
fn test_block_boundaries<F, S, E>(open: F) -> Result<(), anyhow::Error>
where
    F: Fn(CounterSeeds) -> Result<S, E>,
    S: CounterStore + 'static,
    E: Into<anyhow::Error>,
{
    let seeds = CounterSeeds {
        long_id: 0,
        next_number: 0,
    };
    let config = AllocConfig {
        next_number_block_size: 10,
        seeds,
        ..Default::default()
    };
    let first = manager(open(seeds).map_err(Into::into)?, config)?;
    let ids = (0..10)
        .map(|_| first.create_id("SCENARIO"))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert_eq!(first.peek_next_number("SCENARIO")?, 11);
    assert_eq!(first.peek_next_number("SCENARIO")?, 11);
    assert_eq!(first.create_id("SCENARIO")?, 11);

    // The second refill reserved 11..=20, so a fresh process starts at 21.
    let other = manager(open(seeds).map_err(Into::into)?, AllocConfig::default())?;
    assert_eq!(other.create_id("SCENARIO")?, 21);
    Ok(())
}
