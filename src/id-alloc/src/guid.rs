// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AllocError;
use crate::host::MAX_HOST_ID;
use crate::key::ObjectType;

/// A globally unique identifier for a design object.
///
/// Packed into 64 bits as `host_id (24) | type ordinal (8) | uuid (32)`. The
/// uuid is drawn from the long-id counter of the object's type, so two GUIDs
/// of the same type differ in their uuid even when minted on the same host,
/// and GUIDs minted on different hosts differ in their host id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Guid {
    host_id: u32,
    object_type: ObjectType,
    uuid: u32,
}

impl Guid {
    pub fn new(host_id: u32, object_type: ObjectType, uuid: u32) -> Result<Guid, AllocError> {
        if host_id > MAX_HOST_ID {
            return Err(AllocError::invalid(format!(
                "host id {} does not fit in 24 bits",
                host_id
            )));
        }
        Ok(Guid {
            host_id,
            object_type,
            uuid,
        })
    }

    /// Unpacks a GUID from its 64-bit representation.
    pub fn from_u64(value: u64) -> Result<Guid, AllocError> {
        let [h0, h1, h2, ordinal, u0, u1, u2, u3] = value.to_be_bytes();
        let object_type = ObjectType::from_ordinal(ordinal).ok_or_else(|| {
            AllocError::invalid(format!("unknown object type ordinal {} in {}", ordinal, value))
        })?;
        Ok(Guid {
            host_id: u32::from_be_bytes([0, h0, h1, h2]),
            object_type,
            uuid: u32::from_be_bytes([u0, u1, u2, u3]),
        })
    }

    /// The packed 64-bit representation.
    pub fn as_u64(&self) -> u64 {
        let [_, h0, h1, h2] = self.host_id.to_be_bytes();
        let [u0, u1, u2, u3] = self.uuid.to_be_bytes();
        u64::from_be_bytes([h0, h1, h2, self.object_type.ordinal(), u0, u1, u2, u3])
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn uuid(&self) -> u32 {
        self.uuid
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.host_id,
            self.object_type.ordinal(),
            self.uuid
        )
    }
}

impl FromStr for Guid {
    type Err = AllocError;

    /// Parses the `host-type-uuid` form produced by [`Guid`]'s `Display`.
    fn from_str(s: &str) -> Result<Guid, AllocError> {
        let invalid = || AllocError::invalid(format!("invalid guid: {}", s));
        let mut parts = s.split('-');
        let (Some(host), Some(ordinal), Some(uuid), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let host_id: u32 = host.parse().map_err(|_| invalid())?;
        let ordinal: u8 = ordinal.parse().map_err(|_| invalid())?;
        let uuid: u32 = uuid.parse().map_err(|_| invalid())?;
        let object_type = ObjectType::from_ordinal(ordinal).ok_or_else(invalid)?;
        Guid::new(host_id, object_type, uuid)
    }
}
