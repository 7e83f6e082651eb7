// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior};
use tracing::debug;

use crate::config::CounterSeeds;
use crate::error::StoreError;
use crate::host::HostIp;
use crate::store::{
    advance, checked_seeds, CounterStore, HostIdRecord, HOST_IDENTITY_TABLE, LONG_ID_TABLE,
    NEXT_NUMBER_TABLE,
};
use crate::Id;

/// How long a transaction waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A [`CounterStore`] whose counters live in a SQLite database file.
///
/// Transactions begin with `BEGIN IMMEDIATE`, taking the database write lock
/// before the counter is read, so any number of connections to the same file,
/// in this process or others, are linearized.
pub struct SqliteCounterStore {
    seeds: CounterSeeds,
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl fmt::Debug for SqliteCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCounterStore")
            .field("seeds", &self.seeds)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteCounterStore {
    /// Opens the store at `path`, creating the file and counter tables if
    /// needed. If `path` is `None`, the store lives in memory and vanishes
    /// with this value.
    pub fn open(
        path: Option<&Path>,
        seeds: CounterSeeds,
    ) -> Result<SqliteCounterStore, StoreError> {
        let seeds = checked_seeds(seeds)?;
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {LONG_ID_TABLE} (
                key integer PRIMARY KEY,
                value integer NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {NEXT_NUMBER_TABLE} (
                key text PRIMARY KEY,
                value integer NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {HOST_IDENTITY_TABLE} (
                node text PRIMARY KEY,
                host_id integer NOT NULL,
                ip_high integer NOT NULL,
                ip_low integer NOT NULL
            );
            "
        ))?;
        Ok(SqliteCounterStore {
            seeds,
            path: path.map(Path::to_path_buf),
            conn: Mutex::new(conn),
        })
    }

    fn transact<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let res = f(&tx)?;
        tx.commit()?;
        Ok(res)
    }

    fn advance_tx(
        tx: &Transaction,
        table: &str,
        key: &dyn ToSql,
        display_key: &dyn fmt::Display,
        seed: Id,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        tx.execute(
            &format!("INSERT OR IGNORE INTO {table} (key, value) VALUES (?1, ?2)"),
            params![key, seed],
        )?;
        let stored: Id = tx.query_row(
            &format!("SELECT value FROM {table} WHERE key = ?1"),
            params![key],
            |row| row.get(0),
        )?;
        let advance = advance(display_key, stored, block_size, override_minimum)?;
        if let Some(next) = advance.stored {
            tx.execute(
                &format!("UPDATE {table} SET value = ?2 WHERE key = ?1"),
                params![key, next],
            )?;
        }
        debug!(
            %display_key,
            block_size,
            ?override_minimum,
            start = advance.start,
            "advanced counter"
        );
        Ok(advance.start)
    }
}

impl CounterStore for SqliteCounterStore {
    #[tracing::instrument(level = "debug", skip(self))]
    fn advance_long_id(
        &self,
        key: i64,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let seed = self.seeds.long_id;
        self.transact(|tx| {
            Self::advance_tx(
                tx,
                LONG_ID_TABLE,
                &key,
                &key,
                seed,
                block_size,
                override_minimum,
            )
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn advance_next_number(
        &self,
        key: &str,
        block_size: i64,
        override_minimum: Option<Id>,
    ) -> Result<Id, StoreError> {
        let seed = self.seeds.next_number;
        self.transact(|tx| {
            Self::advance_tx(
                tx,
                NEXT_NUMBER_TABLE,
                &key,
                &key,
                seed,
                block_size,
                override_minimum,
            )
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn load_or_replace_host_id(
        &self,
        node: &str,
        ip: HostIp,
        candidate: u32,
    ) -> Result<HostIdRecord, StoreError> {
        self.transact(|tx| {
            let stored = tx
                .query_row(
                    &format!(
                        "SELECT host_id, ip_high, ip_low FROM {HOST_IDENTITY_TABLE}
                         WHERE node = ?1"
                    ),
                    params![node],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            HostIp {
                                high: row.get(1)?,
                                low: row.get(2)?,
                            },
                        ))
                    },
                )
                .optional()?;
            if let Some((host_id, stored_ip)) = stored {
                if stored_ip == ip {
                    let host_id = u32::try_from(host_id).map_err(|_| {
                        StoreError::corrupt(format!("host id {} for node {}", host_id, node))
                    })?;
                    return Ok(HostIdRecord {
                        host_id,
                        previous_ip: Some(stored_ip),
                        generated: false,
                    });
                }
            }
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {HOST_IDENTITY_TABLE} (node, host_id, ip_high, ip_low)
                     VALUES (?1, ?2, ?3, ?4)"
                ),
                params![node, i64::from(candidate), ip.high, ip.low],
            )?;
            Ok(HostIdRecord {
                host_id: candidate,
                previous_ip: stored.map(|(_, ip)| ip),
                generated: true,
            })
        })
    }
}
