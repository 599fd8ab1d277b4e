//! Guest backend adapters.
//!
//! One [`GuestBackend`] implementation per virtualization technology,
//! selected from the guest role and config.

pub mod lxc;
pub mod vm_manager;

use std::collections::BTreeSet;

use spawn_core::config::SpawnConfig;
use spawn_core::guest::{GuestRole, GuestState};
use spawn_core::naming::validate_guest_name;
use spawn_core::{SpawnError, SpawnResult};

/// A post-clone attribute generated by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Mac,
}

impl std::fmt::Display for AddressKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mac => write!(f, "MAC address"),
        }
    }
}

/// Uniform guest operations over one virtualization technology.
///
/// Mutating calls block until the backend returns and may take tens of
/// seconds. A successful `start` says nothing about guest OS readiness.
pub trait GuestBackend {
    /// Short backend identifier for logs.
    fn kind(&self) -> &'static str;

    /// Guests known to the backend. Empty is not an error.
    fn list(&self) -> SpawnResult<BTreeSet<String>>;

    /// Exact-name membership in [`GuestBackend::list`].
    fn exists(&self, name: &str) -> SpawnResult<bool> {
        Ok(self.list()?.contains(name))
    }

    /// Whether a defined guest is currently running.
    fn is_running(&self, name: &str) -> SpawnResult<bool>;

    fn state(&self, name: &str) -> SpawnResult<GuestState> {
        if !self.exists(name)? {
            return Ok(GuestState::Absent);
        }
        Ok(GuestState::from_flags(true, self.is_running(name)?))
    }

    /// Copy `source` to a new stopped guest `dest`.
    fn clone_guest(&self, source: &str, dest: &str) -> SpawnResult<()>;

    /// Start a guest. Already running is a no-op success.
    fn start(&self, name: &str) -> SpawnResult<()>;

    /// Stop a guest. Already stopped is a no-op success.
    fn stop(&self, name: &str) -> SpawnResult<()>;

    /// Read a generated attribute out of backend metadata.
    fn read_generated_address(&self, name: &str, kind: AddressKind) -> SpawnResult<String>;
}

/// Shared clone preconditions: valid names, source present, dest absent.
pub(crate) fn check_clone_preconditions(
    backend: &dyn GuestBackend,
    source: &str,
    dest: &str,
) -> SpawnResult<()> {
    for name in [source, dest] {
        validate_guest_name(name).map_err(|e| SpawnError::backend("clone", name, e))?;
    }
    if source == dest {
        return Err(SpawnError::backend(
            "clone",
            dest,
            "source and destination names are the same",
        ));
    }
    let known = backend.list()?;
    if !known.contains(source) {
        return Err(SpawnError::backend(
            "clone",
            source,
            "source guest does not exist",
        ));
    }
    if known.contains(dest) {
        return Err(SpawnError::backend(
            "clone",
            dest,
            "destination guest already exists",
        ));
    }
    Ok(())
}

/// Pick the backend adapter for a role.
pub fn backend_for(role: GuestRole, config: &SpawnConfig) -> Box<dyn GuestBackend> {
    match role {
        GuestRole::Vm => Box::new(vm_manager::VmManagerBackend::new(
            config.backends.vm_manager.clone(),
        )),
        GuestRole::Ct => Box::new(lxc::LxcBackend::new(config.backends.lxc.clone())),
    }
}

/// Split backend list output into exact names.
///
/// Every whitespace-separated token is a candidate; partial matches are
/// never produced because callers compare whole names.
pub(crate) fn parse_name_lines(output: &str) -> BTreeSet<String> {
    output
        .split_whitespace()
        .filter(|t| validate_guest_name(t).is_ok())
        .map(|t| t.to_string())
        .collect()
}
