// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command-line access to the identifier allocator.
//!
//! Every invocation behaves like a freshly started process: blocks reserved
//! by it but not handed out are skipped by later invocations.

use std::fmt;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use id_alloc::{
    AllocConfig, AllocMetrics, CounterSeeds, CounterStore, Guid, GuidManager, ObjectType,
    PostgresCounterStore, SqliteCounterStore, DEFAULT_LONG_ID_BLOCK_SIZE,
    DEFAULT_NEXT_NUMBER_BLOCK_SIZE, DEFAULT_NODE_NAME,
};

const DEFAULT_LOG_FILTER: &str = "id_alloc=info,idalloc=info";

#[derive(Parser, Debug)]
#[clap(name = "idalloc", next_line_help = true)]
struct Args {
    /// The Postgres database holding the counters, e.g.
    /// `postgres://root@localhost:5432/ids`.
    #[clap(
        long,
        env = "IDALLOC_POSTGRES_URL",
        value_name = "URL",
        conflicts_with = "sqlite_path",
        required_unless_present = "sqlite_path",
        hide_env_values = true
    )]
    postgres_url: Option<String>,
    /// The SQLite database file holding the counters. Created if missing.
    #[clap(long, env = "IDALLOC_SQLITE_PATH", value_name = "PATH")]
    sqlite_path: Option<PathBuf>,
    /// The name under which this host's identity is persisted.
    #[clap(long, env = "IDALLOC_NODE_NAME", default_value = DEFAULT_NODE_NAME)]
    node_name: String,
    /// Identifiers reserved per refill for GUID sequences.
    #[clap(
        long,
        env = "IDALLOC_LONG_ID_BLOCK_SIZE",
        default_value_t = DEFAULT_LONG_ID_BLOCK_SIZE
    )]
    long_id_block_size: i64,
    /// Identifiers reserved per refill for named sequences.
    #[clap(
        long,
        env = "IDALLOC_NEXT_NUMBER_BLOCK_SIZE",
        default_value_t = DEFAULT_NEXT_NUMBER_BLOCK_SIZE
    )]
    next_number_block_size: i64,
    /// The value new GUID counters are created with.
    #[clap(long, env = "IDALLOC_LONG_ID_SEED", default_value_t = CounterSeeds::default().long_id)]
    long_id_seed: i64,
    /// The value new named counters are created with.
    #[clap(
        long,
        env = "IDALLOC_NEXT_NUMBER_SEED",
        default_value_t = CounterSeeds::default().next_number
    )]
    next_number_seed: i64,
    /// Print results as JSON.
    #[clap(long)]
    json: bool,
    /// Print the allocator's Prometheus metrics to stderr when done.
    #[clap(long)]
    metrics: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint GUIDs for design objects.
    Guid {
        /// The object type, e.g. `template` or `folder`.
        #[clap(long = "type", value_name = "TYPE")]
        object_type: ObjectType,
        /// Draw from the sequence private to this repository.
        #[clap(long, value_name = "ID")]
        repository: Option<i32>,
        #[clap(long, default_value_t = 1)]
        count: usize,
    },
    /// Hand out numbers from a named sequence one at a time.
    Next {
        key: String,
        #[clap(long, default_value_t = 1)]
        count: usize,
    },
    /// Reserve a block of consecutive numbers from a named sequence.
    Block { key: String, size: i64 },
    /// Show the next number of a named sequence without consuming it.
    Peek { key: String },
    /// Ensure every future number of a named sequence is at least `value`.
    Fix {
        key: String,
        #[clap(allow_negative_numbers = true)]
        value: i32,
    },
    /// Show this host's id, deriving it if needed.
    HostId,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Output {
    Guids { guids: Vec<GuidOutput> },
    Ids { key: String, ids: Vec<i32> },
    Peek { key: String, next: i32 },
    Fix { key: String, previous_next: i32 },
    HostId { host_id: u32 },
}

#[derive(Debug, Serialize)]
struct GuidOutput {
    guid: String,
    value: u64,
    object_type: String,
}

impl From<Guid> for GuidOutput {
    fn from(guid: Guid) -> GuidOutput {
        GuidOutput {
            guid: guid.to_string(),
            value: guid.as_u64(),
            object_type: guid.object_type().to_string(),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Output::Guids { guids } => {
                for guid in guids {
                    writeln!(f, "{}\t{}", guid.guid, guid.value)?;
                }
                Ok(())
            }
            Output::Ids { ids, .. } => {
                for id in ids {
                    writeln!(f, "{}", id)?;
                }
                Ok(())
            }
            Output::Peek { next, .. } => writeln!(f, "{}", next),
            Output::Fix { previous_next, .. } => writeln!(f, "{}", previous_next),
            Output::HostId { host_id } => writeln!(f, "{}", host_id),
        }
    }
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    if let Err(err) = run(args) {
        eprintln!("idalloc: fatal: {:#}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), anyhow::Error> {
    let config = AllocConfig {
        long_id_block_size: args.long_id_block_size,
        next_number_block_size: args.next_number_block_size,
        seeds: CounterSeeds {
            long_id: args.long_id_seed,
            next_number: args.next_number_seed,
        },
        node_name: args.node_name,
    };
    config.validate()?;

    let store: Arc<dyn CounterStore> = match (args.postgres_url, args.sqlite_path) {
        (Some(url), None) => Arc::new(
            PostgresCounterStore::connect(&url, config.seeds)
                .context("opening postgres counter store")?,
        ),
        (None, Some(path)) => Arc::new(
            SqliteCounterStore::open(Some(path.as_path()), config.seeds)
                .with_context(|| format!("opening sqlite counter store {}", path.display()))?,
        ),
        _ => bail!("exactly one of --postgres-url and --sqlite-path is required"),
    };
    info!(?store, node = %config.node_name, "opened counter store");

    let registry = prometheus::Registry::new();
    let metrics = AllocMetrics::register_into(&registry)?;
    let manager = GuidManager::new(store, config, &metrics)?;

    let output = execute(&manager, args.command)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", output);
    }

    if args.metrics {
        let mut buf = String::new();
        prometheus::TextEncoder::new().encode_utf8(&registry.gather(), &mut buf)?;
        eprint!("{}", buf);
    }
    Ok(())
}

fn execute(manager: &GuidManager, command: Command) -> Result<Output, anyhow::Error> {
    let output = match command {
        Command::Guid {
            object_type,
            repository,
            count,
        } => {
            let guids = (0..count)
                .map(|_| match repository {
                    Some(repository) => manager.create_guid_in_repository(repository, object_type),
                    None => manager.create_guid(object_type),
                })
                .map(|guid| guid.map(GuidOutput::from))
                .collect::<Result<_, _>>()?;
            Output::Guids { guids }
        }
        Command::Next { key, count } => {
            let ids = (0..count)
                .map(|_| manager.create_id(&key))
                .collect::<Result<_, _>>()?;
            Output::Ids { key, ids }
        }
        Command::Block { key, size } => {
            let ids = manager.create_id_block(&key, size)?;
            Output::Ids { key, ids }
        }
        Command::Peek { key } => {
            let next = manager.peek_next_number(&key)?;
            Output::Peek { key, next }
        }
        Command::Fix { key, value } => {
            let previous_next = manager.fix_next_number(&key, value)?;
            info!(%key, value, previous_next, "fixed next number");
            Output::Fix { key, previous_next }
        }
        Command::HostId => Output::HostId {
            host_id: manager.host_id()?,
        },
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::try_parse_from([
            "idalloc",
            "--sqlite-path",
            "ids.db",
            "guid",
            "--type",
            "template",
            "--count",
            "3",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Guid {
                object_type: ObjectType::Template,
                repository: None,
                count: 3
            }
        ));

        let args =
            Args::try_parse_from(["idalloc", "--sqlite-path", "ids.db", "fix", "CONTENT", "-5"])
                .unwrap();
        assert!(matches!(args.command, Command::Fix { value: -5, .. }));
    }

    #[test]
    fn test_store_flags_conflict() {
        let both = Args::try_parse_from([
            "idalloc",
            "--sqlite-path",
            "ids.db",
            "--postgres-url",
            "postgres://localhost",
            "host-id",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_execute() -> Result<(), anyhow::Error> {
        let store: Arc<dyn CounterStore> =
            Arc::new(SqliteCounterStore::open(None, CounterSeeds::default())?);
        let manager = GuidManager::new(store, AllocConfig::default(), &AllocMetrics::noop())?;

        let output = execute(
            &manager,
            Command::Next {
                key: "CONTENT".into(),
                count: 2,
            },
        )?;
        assert_eq!(output.to_string(), "101\n102\n");

        let output = execute(
            &manager,
            Command::Block {
                key: "CONTENT".into(),
                size: 3,
            },
        )?;
        assert_eq!(
            serde_json::to_value(&output)?,
            serde_json::json!({"key": "CONTENT", "ids": [103, 104, 105]})
        );

        let output = execute(
            &manager,
            Command::Fix {
                key: "CONTENT".into(),
                value: 1000,
            },
        )?;
        assert_eq!(
            serde_json::to_value(&output)?,
            serde_json::json!({"key": "CONTENT", "previous_next": 103})
        );
        let output = execute(&manager, Command::Peek { key: "CONTENT".into() })?;
        assert_eq!(output.to_string(), "1000\n");
        Ok(())
    }
}
