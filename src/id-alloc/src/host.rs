// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-process host identity.
//!
//! Every GUID carries a 24-bit host id so that identifiers minted on
//! different hosts remain distinguishable. The id is random, persisted per
//! node together with the node's network address, and regenerated only when
//! that address changes.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rand::Rng;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::CounterStore;

/// The largest host id; host ids occupy 24 bits of a GUID.
pub const MAX_HOST_ID: u32 = 0xFF_FFFF;

/// A network address widened to 128 bits and split into the two signed
/// 64-bit halves it is persisted as.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostIp {
    pub high: i64,
    pub low: i64,
}

impl HostIp {
    /// The all-zero address, used when the local address cannot be resolved.
    pub const UNSPECIFIED: HostIp = HostIp { high: 0, low: 0 };

    pub fn from_bits(bits: u128) -> HostIp {
        let bytes = bits.to_be_bytes();
        let mut high = [0u8; 8];
        let mut low = [0u8; 8];
        high.copy_from_slice(&bytes[..8]);
        low.copy_from_slice(&bytes[8..]);
        HostIp {
            high: i64::from_be_bytes(high),
            low: i64::from_be_bytes(low),
        }
    }

    pub fn to_bits(&self) -> u128 {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.high.to_be_bytes());
        bytes[8..].copy_from_slice(&self.low.to_be_bytes());
        u128::from_be_bytes(bytes)
    }
}

impl From<Ipv4Addr> for HostIp {
    fn from(ip: Ipv4Addr) -> HostIp {
        HostIp::from_bits(u128::from(u32::from(ip)))
    }
}

impl From<Ipv6Addr> for HostIp {
    fn from(ip: Ipv6Addr) -> HostIp {
        HostIp::from_bits(u128::from(ip))
    }
}

impl From<IpAddr> for HostIp {
    fn from(ip: IpAddr) -> HostIp {
        match ip {
            IpAddr::V4(ip) => HostIp::from(ip),
            IpAddr::V6(ip) => HostIp::from(ip),
        }
    }
}

impl fmt::Debug for HostIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostIp({:#034x})", self.to_bits())
    }
}

/// Resolves the address of this host's primary interface, preferring IPv4
/// and falling back to IPv6 on hosts without an IPv4 address.
pub fn local_ip() -> io::Result<IpAddr> {
    local_ip_address::local_ip()
        .or_else(|err| match err {
            local_ip_address::Error::LocalIpAddressNotFound => local_ip_address::local_ipv6(),
            _ => Err(err),
        })
        .map_err(io::Error::other)
}

/// Draws a random, non-zero host id.
pub fn generate_host_id<R: Rng>(rng: &mut R) -> u32 {
    rng.gen_range(1..=MAX_HOST_ID)
}

/// Lazily derives and caches this process's host id.
pub struct HostIdentity {
    node: String,
    resolve: fn() -> io::Result<IpAddr>,
    /// Zero until derived; host ids are never zero.
    cached: AtomicU32,
    init: Mutex<()>,
}

impl fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostIdentity")
            .field("node", &self.node)
            .field("cached", &self.cached.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HostIdentity {
    /// A host identity for `node` that resolves the local address with
    /// [`local_ip`].
    pub fn new(node: impl Into<String>) -> HostIdentity {
        HostIdentity::with_resolver(node, local_ip)
    }

    pub fn with_resolver(
        node: impl Into<String>,
        resolve: fn() -> io::Result<IpAddr>,
    ) -> HostIdentity {
        HostIdentity {
            node: node.into(),
            resolve,
            cached: AtomicU32::new(0),
            init: Mutex::new(()),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// The address used to detect host moves. Falls back to the zero address
    /// when resolution fails.
    pub fn current_ip(&self) -> HostIp {
        match (self.resolve)() {
            Ok(ip) => HostIp::from(ip),
            Err(e) => {
                warn!(node = %self.node, "unable to resolve local address, using 0.0.0.0: {}", e);
                HostIp::UNSPECIFIED
            }
        }
    }

    /// Returns the host id, deriving it through `store` on first use.
    pub fn host_id(&self, store: &dyn CounterStore) -> Result<u32, StoreError> {
        let id = self.cached.load(Ordering::Acquire);
        if id != 0 {
            return Ok(id);
        }
        let _guard = self.init.lock().expect("lock poisoned");
        let id = self.cached.load(Ordering::Acquire);
        if id != 0 {
            return Ok(id);
        }

        let ip = self.current_ip();
        let candidate = generate_host_id(&mut rand::thread_rng());
        let record = store.load_or_replace_host_id(&self.node, ip, candidate)?;
        if record.host_id == 0 || record.host_id > MAX_HOST_ID {
            return Err(StoreError::corrupt(format!(
                "host id {} for node {} is out of range",
                record.host_id, self.node
            )));
        }
        if record.generated {
            info!(
                node = %self.node,
                host_id = record.host_id,
                previous_ip = ?record.previous_ip,
                current_ip = ?ip,
                "generated new host id"
            );
        }
        self.cached.store(record.host_id, Ordering::Release);
        Ok(record.host_id)
    }
}
