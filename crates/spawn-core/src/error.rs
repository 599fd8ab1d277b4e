use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

use crate::phase::{SpawnPhase, SpawnStep};

/// Result alias for operations that fail with a [`SpawnError`].
pub type SpawnResult<T> = std::result::Result<T, SpawnError>;

/// Errors raised by the spawn workflow and its collaborators.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Provisioning manifest incomplete. Lists every missing file.
    #[error("provisioning manifest incomplete, missing: {}", display_paths(.missing))]
    MissingFile { missing: Vec<PathBuf> },

    /// Backend rejected a clone/start/stop/list call.
    #[error("backend {verb} failed for '{guest}': {message}")]
    Backend {
        verb: String,
        guest: String,
        message: String,
    },

    /// An expected guest or guest attribute is absent.
    #[error("{what} not found for guest '{guest}'")]
    NotFound { guest: String, what: String },

    /// Reachability polling exceeded its budget.
    #[error(
        "'{label}' not reachable at {target} after {attempts} probes ({timeout_secs}s budget, best streak {best_streak})"
    )]
    Timeout {
        label: String,
        target: Ipv4Addr,
        timeout_secs: u64,
        attempts: u64,
        best_streak: u32,
    },

    /// The guest is up but its DHCP lease never showed up.
    #[error("no DHCP lease for '{hostname}' appeared within {timeout_secs}s")]
    LeaseTimeout { hostname: String, timeout_secs: u64 },

    /// No free address left in the allocation range.
    #[error("no free address for prefix '{prefix}' in {network}.{first}..={last}")]
    Exhausted {
        prefix: String,
        network: String,
        first: u8,
        last: u8,
    },

    /// Invalid configuration or call arguments.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Remote command or file transfer failed.
    #[error("remote {action} on {target} failed: {message}")]
    Remote {
        action: String,
        target: String,
        message: String,
    },

    /// Operator aborted a bounded wait.
    #[error("cancelled while waiting for '{label}'")]
    Cancelled { label: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    pub fn backend(verb: &str, guest: &str, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            verb: verb.to_string(),
            guest: guest.to_string(),
            message: message.to_string(),
        }
    }

    pub fn not_found(guest: &str, what: &str) -> Self {
        Self::NotFound {
            guest: guest.to_string(),
            what: what.to_string(),
        }
    }

    pub fn remote(action: &str, target: &str, message: impl std::fmt::Display) -> Self {
        Self::Remote {
            action: action.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    /// True for bounded-wait failures where the guest may still be usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::LeaseTimeout { .. })
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A spawn that stopped at a specific step.
///
/// `phase` is the last state the guest reached; partial state (a cloned or
/// running guest) is left in place for diagnosis.
#[derive(Debug, Error)]
#[error("spawn failed at step '{step}' (reached {phase}{}): {source}", guest_suffix(.guest))]
pub struct SpawnFailure {
    pub step: SpawnStep,
    pub phase: SpawnPhase,
    pub guest: Option<String>,
    #[source]
    pub source: SpawnError,
}

fn guest_suffix(guest: &Option<String>) -> String {
    match guest {
        Some(name) => format!(", guest '{}'", name),
        None => String::new(),
    }
}
