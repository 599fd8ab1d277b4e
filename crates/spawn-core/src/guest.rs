use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::naming;

/// Guest flavour. Selects the backend and the address parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestRole {
    /// QEMU virtual machine, even address offsets.
    Vm,
    /// LXC container, odd address offsets.
    Ct,
}

impl GuestRole {
    /// Name prefix for generated guests of this role.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Ct => "ct",
        }
    }
}

impl std::fmt::Display for GuestRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for GuestRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vm" => Ok(Self::Vm),
            "ct" | "lxc" => Ok(Self::Ct),
            other => bail!("Unknown guest role {:?} (expected 'vm' or 'ct')", other),
        }
    }
}

/// Lifecycle state as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestState {
    Absent,
    Stopped,
    Running,
}

impl GuestState {
    /// Collapse the independent "exists" and "running" flags.
    ///
    /// A backend that reports a running process for an undefined guest is
    /// still treated as `Absent`.
    pub fn from_flags(exists: bool, running: bool) -> Self {
        match (exists, running) {
            (false, _) => Self::Absent,
            (true, false) => Self::Stopped,
            (true, true) => Self::Running,
        }
    }
}

impl std::fmt::Display for GuestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// A named guest instance known to one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestSpec {
    pub name: String,
    pub role: GuestRole,
    pub state: GuestState,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
}

impl GuestSpec {
    pub fn new(name: &str, role: GuestRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            state: GuestState::Absent,
            mac: None,
            ip: None,
        }
    }
}

/// Operator-declared fixed (MAC, IP, hostname) binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseReservation {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: String,
}

impl LeaseReservation {
    /// Build a reservation, validating and normalizing the MAC.
    pub fn new(mac: &str, ip: Ipv4Addr, hostname: &str) -> Result<Self> {
        let mac = naming::normalize_mac(mac)?;
        naming::validate_guest_name(hostname)?;
        Ok(Self {
            mac,
            ip,
            hostname: hostname.to_string(),
        })
    }

    /// Reservation store line: `mac,ip,name`.
    pub fn to_record(&self) -> String {
        format!("{},{},{}", self.mac, self.ip, self.hostname)
    }
}
