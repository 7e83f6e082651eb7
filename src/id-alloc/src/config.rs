// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Allocator configuration.

use serde::{Deserialize, Serialize};

use crate::error::AllocError;
use crate::Id;

/// The default number of long ids reserved per refill.
pub const DEFAULT_LONG_ID_BLOCK_SIZE: i64 = 20;

/// The default number of next numbers reserved per refill.
pub const DEFAULT_NEXT_NUMBER_BLOCK_SIZE: i64 = 1;

/// The node name used when none is configured.
pub const DEFAULT_NODE_NAME: &str = "default";

/// The values counter rows are created with.
///
/// A row stores the last identifier already reserved, so the first
/// identifier a fresh counter hands out is its seed plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterSeeds {
    pub long_id: Id,
    pub next_number: Id,
}

impl Default for CounterSeeds {
    fn default() -> CounterSeeds {
        CounterSeeds {
            long_id: 1,
            next_number: 100,
        }
    }
}

/// Configures a [`GuidManager`](crate::GuidManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocConfig {
    /// Identifiers reserved per refill for typed (GUID) keys.
    pub long_id_block_size: i64,
    /// Identifiers reserved per refill for named keys.
    pub next_number_block_size: i64,
    /// Seeds for newly created counter rows.
    pub seeds: CounterSeeds,
    /// The name under which this process's host identity is persisted.
    pub node_name: String,
}

impl Default for AllocConfig {
    fn default() -> AllocConfig {
        AllocConfig {
            long_id_block_size: DEFAULT_LONG_ID_BLOCK_SIZE,
            next_number_block_size: DEFAULT_NEXT_NUMBER_BLOCK_SIZE,
            seeds: CounterSeeds::default(),
            node_name: DEFAULT_NODE_NAME.into(),
        }
    }
}

impl AllocConfig {
    pub fn validate(&self) -> Result<(), AllocError> {
        validate_block_size("long_id_block_size", self.long_id_block_size)?;
        validate_block_size("next_number_block_size", self.next_number_block_size)?;
        if self.seeds.long_id < 0 || self.seeds.next_number < 0 {
            return Err(AllocError::invalid(format!(
                "counter seeds must not be negative: {:?}",
                self.seeds
            )));
        }
        if self.node_name.trim().is_empty() {
            return Err(AllocError::invalid("node name must not be empty"));
        }
        Ok(())
    }
}

pub(crate) fn validate_block_size(name: &str, block_size: i64) -> Result<(), AllocError> {
    if block_size <= 0 {
        return Err(AllocError::invalid(format!(
            "{} must be positive: {}",
            name, block_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AllocConfig::default();
        config.validate().unwrap();
        assert_eq!(config.seeds.next_number, 100);
        assert_eq!(config.seeds.long_id, 1);
    }

    #[test]
    fn test_validate() {
        let mut config = AllocConfig::default();
        config.long_id_block_size = 0;
        assert!(matches!(config.validate(), Err(AllocError::InvalidArgument(_))));

        let mut config = AllocConfig::default();
        config.next_number_block_size = -5;
        assert!(config.validate().is_err());

        let mut config = AllocConfig::default();
        config.seeds.long_id = -1;
        assert!(config.validate().is_err());

        let mut config = AllocConfig::default();
        config.node_name = " ".into();
        assert!(config.validate().is_err());
    }
}
