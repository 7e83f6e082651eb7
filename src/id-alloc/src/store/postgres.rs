// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::sync::Mutex;

use postgres::{Client, NoTls, Transaction};
use tracing::debug;

use crate::config::CounterSeeds;
use crate::error::StoreError;
use crate::host::HostIp;
use crate::store::{
    advance, checked_seeds, CounterStore, HostIdRecord, HOST_IDENTITY_TABLE, LONG_ID_TABLE,
    NEXT_NUMBER_TABLE,
};
use crate::Id;

/// A [`CounterStore`] whose counters live in a Postgres database.
///
/// Every read-modify-write runs in its own transaction and takes a row lock
/// with `SELECT ... FOR UPDATE`, so concurrent allocators in any number of
/// processes are linearized per key. A failed transaction is rolled back in
/// full.
///
/// The connection is shared by all callers in this process. Contention on it
/// is bounded by the block size: most allocations never reach the store.
///
/// The connection is never re-established. Once it is lost every refill
/// fails, and retrying requires opening a new store.
pub struct PostgresCounterStore {
    seeds: CounterSeeds,
    conn: Mutex<Client>,
}

impl fmt::Debug for PostgresCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCounterStore")
            .field("seeds", &self.seeds)
            .finish_non_exhaustive()
    }
}

impl PostgresCounterStore {
    /// Connects to `url` and creates the counter tables if needed.
    pub fn connect(url: &str, seeds: CounterSeeds) -> Result<PostgresCounterStore, StoreError> {
        let conn = Client::connect(url, NoTls)?;
        PostgresCounterStore::open(conn, seeds)
    }

    /// Opens the store over an existing connection, creating the counter
    /// tables if needed.
    pub fn open(
        mut conn: Client,
        seeds: CounterSeeds,
    ) -> Result<PostgresCounterStore, StoreError> {
        let seeds = checked_seeds(seeds)?;
        conn.batch_execute(&format!(
            "
            CREATE TABLE IF NOT EXISTS {LONG_ID_TABLE} (
                key bigint PRIMARY KEY,
                value bigint NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {NEXT_NUMBER_TABLE} (
                key text PRIMARY KEY,
                value bigint NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {HOST_IDENTITY_TABLE} (
                node text PRIMARY KEY,
                host_id bigint NOT NULL,
                ip_high bigint NOT NULL,
                ip_low bigint NOT NULL
            );
            "
        ))?;
        Ok(PostgresCounterStore {
            seeds,
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` in a transaction, committing if it returns `Ok`. Dropping the
    /// transaction on error rolls it back.
    fn transact<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let mut tx = conn.transaction()?;
        let res = f(&mut tx)?;
        tx.commit()?;
        Ok(res)
    }

    /// The read-modify-write shared by both counter tables. `key` is bound as
    /// the first parameter of every statement.
    fn advance_tx(
        tx: &mut Transaction,
        table: &str,
        key: &(dyn postgres::types::ToSql + Sync),
        display_key: &dyn fmt::Display,
        seed: Id,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        tx.execute(
            &format!(
                "INSERT INTO {table} (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO NOTHING"
            ),
            &[key, &seed],
        )?;
        let stored: Id = tx
            .query_one(
                &format!("SELECT value FROM {table} WHERE key = $1 FOR UPDATE"),
                &[key],
            )?
            .try_get("value")?;
        let advance = advance(display_key, stored, block_size, override_minimum)?;
        if let Some(next) = advance.stored {
            tx.execute(
                &format!("UPDATE {table} SET value = $2 WHERE key = $1"),
                &[key, &next],
            )?;
        }
        Ok(advance.start)
    }
}

impl CounterStore for PostgresCounterStore {
    #[tracing::instrument(level = "debug", skip(self))]
    fn advance_long_id(
        &self,
        key: i64,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let seed = self.seeds.long_id;
        let start = self.transact(|tx| {
            Self::advance_tx(
                tx,
                LONG_ID_TABLE,
                &key,
                &key,
                seed,
                block_size,
                override_minimum,
            )
        })?;
        debug!(start, "advanced long id counter");
        Ok(start)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn advance_next_number(
        &self,
        key: &str,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let seed = self.seeds.next_number;
        let start = self.transact(|tx| {
            Self::advance_tx(
                tx,
                NEXT_NUMBER_TABLE,
                &key,
                &key,
                seed,
                block_size,
                override_minimum,
            )
        })?;
        debug!(start, "advanced next number counter");
        Ok(start)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn load_or_replace_host_id(
        &self,
        node: &str,
        ip: HostIp,
        candidate: u32,
    ) -> Result<HostIdRecord, StoreError> {
        self.transact(|tx| {
            // Serialize concurrent first-time derivations for the same node.
            tx.execute(
                &format!(
                    "INSERT INTO {HOST_IDENTITY_TABLE} (node, host_id, ip_high, ip_low)
                     VALUES ($1, 0, 0, 0) ON CONFLICT (node) DO NOTHING"
                ),
                &[&node],
            )?;
            let row = tx.query_one(
                &format!(
                    "SELECT host_id, ip_high, ip_low FROM {HOST_IDENTITY_TABLE}
                     WHERE node = $1 FOR UPDATE"
                ),
                &[&node],
            )?;
            let host_id: i64 = row.try_get("host_id")?;
            let stored_ip = HostIp {
                high: row.try_get("ip_high")?,
                low: row.try_get("ip_low")?,
            };
            if host_id != 0 && stored_ip == ip {
                let host_id = u32::try_from(host_id).map_err(|_| {
                    StoreError::corrupt(format!("host id {} for node {}", host_id, node))
                })?;
                return Ok(HostIdRecord {
                    host_id,
                    previous_ip: Some(stored_ip),
                    generated: false,
                });
            }
            tx.execute(
                &format!(
                    "UPDATE {HOST_IDENTITY_TABLE} SET host_id = $2, ip_high = $3, ip_low = $4
                     WHERE node = $1"
                ),
                &[&node, &i64::from(candidate), &ip.high, &ip.low],
            )?;
            Ok(HostIdRecord {
                host_id: candidate,
                previous_ip: (host_id != 0).then_some(stored_ip),
                generated: true,
            })
        })
    }
}
