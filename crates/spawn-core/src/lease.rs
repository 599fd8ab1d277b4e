//! Address allocation policy and lease-table parsing.
//!
//! Everything here is pure: callers read the lease table and reservation
//! store and hand the text in.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::{SpawnError, SpawnResult};

/// Offset iteration order keyed by the hostname prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPolicy {
    /// `ct*`: 3, 5, 7, ...
    Odd,
    /// `vm*`: 2, 4, 6, ...
    Even,
    /// Anything else: 2, 3, 4, ...
    Sequential,
}

impl AllocationPolicy {
    pub fn for_hostname(prefix: &str) -> Self {
        let lower = prefix.to_ascii_lowercase();
        if lower.starts_with("ct") {
            Self::Odd
        } else if lower.starts_with("vm") {
            Self::Even
        } else {
            Self::Sequential
        }
    }

    pub fn first_offset(self) -> u8 {
        match self {
            Self::Odd => 3,
            Self::Even | Self::Sequential => 2,
        }
    }

    pub fn step(self) -> usize {
        match self {
            Self::Odd | Self::Even => 2,
            Self::Sequential => 1,
        }
    }

    /// Candidate offsets in ascending order, bounded by `max` (inclusive).
    pub fn offsets(self, max: u8) -> impl Iterator<Item = u8> {
        (self.first_offset()..=max).step_by(self.step())
    }
}

/// The first three octets of the guest network, e.g. `192.168.112`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkPrefix([u8; 3]);

impl NetworkPrefix {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    pub fn address(&self, offset: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], offset)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.octets()[..3] == self.0
    }
}

impl FromStr for NetworkPrefix {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_end_matches('.');
        let parts: Vec<&str> = trimmed.split('.').collect();
        if parts.len() != 3 {
            bail!("Network prefix must have three octets (e.g. 192.168.112), got {:?}", s);
        }
        let mut octets = [0u8; 3];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid octet {:?} in network prefix {:?}", part, s))?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for NetworkPrefix {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NetworkPrefix> for String {
    fn from(p: NetworkPrefix) -> Self {
        p.to_string()
    }
}

impl std::fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Whole-token search over lease/reservation text.
///
/// Tokens are separated by whitespace or commas, so `192.168.112.2` does
/// not match inside `192.168.112.20`.
pub fn contains_token(text: &str, token: &str) -> bool {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .any(|t| t == token)
}

/// Pick the first free address for `hostname_prefix`.
///
/// An address is taken if it appears as a token in any of `tables`.
pub fn select_free_address(
    hostname_prefix: &str,
    network: NetworkPrefix,
    max_offset: u8,
    tables: &[&str],
) -> SpawnResult<Ipv4Addr> {
    let policy = AllocationPolicy::for_hostname(hostname_prefix);
    for offset in policy.offsets(max_offset) {
        let candidate = network.address(offset);
        let token = candidate.to_string();
        if !tables.iter().any(|t| contains_token(t, &token)) {
            return Ok(candidate);
        }
    }
    Err(SpawnError::Exhausted {
        prefix: hostname_prefix.to_string(),
        network: network.to_string(),
        first: policy.first_offset(),
        last: max_offset,
    })
}

/// One row of a dnsmasq leases file: `expiry mac ip hostname client-id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    pub expiry: u64,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
}

/// Parse a lease table by field position, skipping malformed rows.
pub fn parse_lease_table(text: &str) -> Vec<LeaseEntry> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            Some(LeaseEntry {
                expiry: fields[0].parse().ok()?,
                mac: fields[1].to_ascii_lowercase(),
                ip: fields[2].parse().ok()?,
                hostname: fields[3].to_string(),
            })
        })
        .collect()
}

/// Latest lease whose hostname column equals `hostname` exactly.
pub fn find_lease(text: &str, hostname: &str) -> Option<LeaseEntry> {
    parse_lease_table(text)
        .into_iter()
        .filter(|e| e.hostname == hostname)
        .max_by_key(|e| e.expiry)
}
