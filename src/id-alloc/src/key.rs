// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Keys that identify counter streams.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AllocError;

/// The factor a repository id is multiplied by before it is folded into a
/// [`TypedKey`].
pub const REPOSITORY_KEY_FACTOR: i64 = 1000;

/// The largest repository id whose salted key still fits in 32 bits.
pub const MAX_REPOSITORY_ID: i32 = 2_147_482;

/// Generates [`ObjectType`] along with its ordinal and name tables.
macro_rules! object_types {
    ($($(#[$meta:meta])* $variant:ident = $ordinal:literal => $name:literal,)*) => {
        /// The kinds of design objects that receive GUIDs.
        ///
        /// Ordinals are persisted as part of typed counter keys and embedded
        /// in every GUID, so they must never be renumbered.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum ObjectType {
            $($(#[$meta])* $variant,)*
        }

        impl ObjectType {
            /// Every object type, in ordinal order.
            pub const ALL: &'static [ObjectType] = &[$(ObjectType::$variant,)*];

            /// The stable ordinal of this type.
            pub fn ordinal(&self) -> u8 {
                match self {
                    $(ObjectType::$variant => $ordinal,)*
                }
            }

            /// Looks up a type by its ordinal.
            pub fn from_ordinal(ordinal: u8) -> Option<ObjectType> {
                match ordinal {
                    $($ordinal => Some(ObjectType::$variant),)*
                    _ => None,
                }
            }

            /// The lowercase name used on the command line and in logs.
            pub fn name(&self) -> &'static str {
                match self {
                    $(ObjectType::$variant => $name,)*
                }
            }
        }

        impl FromStr for ObjectType {
            type Err = AllocError;

            fn from_str(s: &str) -> Result<ObjectType, AllocError> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(ObjectType::$variant),)*
                    _ => Err(AllocError::invalid(format!("unknown object type: {}", s))),
                }
            }
        }
    };
}

object_types! {
    Acl = 1 => "acl",
    AclEntry = 2 => "acl_entry",
    Action = 3 => "action",
    Community = 4 => "community",
    ContentType = 5 => "content_type",
    Template = 6 => "template",
    Slot = 7 => "slot",
    Workflow = 8 => "workflow",
    State = 9 => "state",
    Transition = 10 => "transition",
    Relationship = 11 => "relationship",
    RelationshipConfig = 12 => "relationship_config",
    Role = 13 => "role",
    Site = 14 => "site",
    Folder = 15 => "folder",
    Keyword = 16 => "keyword",
    ItemFilter = 17 => "item_filter",
    LocationScheme = 18 => "location_scheme",
    DeliveryType = 19 => "delivery_type",
    Edition = 20 => "edition",
    PublishingJob = 21 => "publishing_job",
    /// Content item revisions share the legacy content id space and are
    /// keyed separately from design objects.
    ItemRevision = 22 => "item_revision",
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A key for a 64-bit long-id sequence, derived from an [`ObjectType`]
/// ordinal and optionally salted by a repository id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypedKey {
    object_type: ObjectType,
    value: i64,
}

impl TypedKey {
    /// The unsalted key for `object_type`.
    pub fn new(object_type: ObjectType) -> TypedKey {
        TypedKey {
            object_type,
            value: i64::from(object_type.ordinal()),
        }
    }

    /// The key for `object_type` within repository `repository_id`, computed
    /// as `ordinal + repository_id * 1000`.
    pub fn in_repository(
        repository_id: i32,
        object_type: ObjectType,
    ) -> Result<TypedKey, AllocError> {
        if repository_id < 0 {
            return Err(AllocError::invalid(format!(
                "repository id must not be negative: {}",
                repository_id
            )));
        }
        if repository_id > MAX_REPOSITORY_ID {
            return Err(AllocError::invalid(format!(
                "repository id {} exceeds the maximum of {}",
                repository_id, MAX_REPOSITORY_ID
            )));
        }
        let salt = i64::from(repository_id) * REPOSITORY_KEY_FACTOR;
        Ok(TypedKey {
            object_type,
            value: i64::from(object_type.ordinal()) + salt,
        })
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    /// The integer under which the counter is persisted.
    pub fn value(&self) -> i64 {
        self.value
    }
}

/// A key for a 32-bit "next number" sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NamedKey(String);

impl NamedKey {
    /// Validates `name` as a named key. Only the empty name is rejected;
    /// keys are otherwise matched byte for byte.
    pub fn new(name: impl Into<String>) -> Result<NamedKey, AllocError> {
        let name = name.into();
        if name.is_empty() {
            return Err(AllocError::invalid("next-number key must not be empty"));
        }
        Ok(NamedKey(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamedKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a counter stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AllocationKey {
    Typed(TypedKey),
    Named(NamedKey),
}

impl AllocationKey {
    /// The metrics and log label for this key's counter namespace.
    pub fn namespace(&self) -> &'static str {
        match self {
            AllocationKey::Typed(_) => "long_id",
            AllocationKey::Named(_) => "next_number",
        }
    }
}

impl From<TypedKey> for AllocationKey {
    fn from(key: TypedKey) -> AllocationKey {
        AllocationKey::Typed(key)
    }
}

impl From<NamedKey> for AllocationKey {
    fn from(key: NamedKey) -> AllocationKey {
        AllocationKey::Named(key)
    }
}

impl fmt::Display for AllocationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocationKey::Typed(key) => write!(f, "long_id:{}", key.value()),
            AllocationKey::Named(key) => write!(f, "next_number:{}", key),
        }
    }
}
