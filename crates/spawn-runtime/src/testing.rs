//! In-memory collaborators for orchestration tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::rc::Rc;

use spawn_core::config::SpawnConfig;
use spawn_core::{SpawnError, SpawnResult};

use crate::backend::{AddressKind, GuestBackend};
use crate::network::{DhcpDaemon, Probe};
use crate::remote::{GuestTarget, RemoteChannel};

#[derive(Debug, Clone)]
struct MockGuest {
    running: bool,
    mac: Option<String>,
}

/// Backend holding guests in a map. Mutating calls and MAC reads are logged
/// as `"<verb> <args>"`; list/state queries are only counted.
#[derive(Default)]
pub struct MockBackend {
    guests: RefCell<BTreeMap<String, MockGuest>>,
    calls: RefCell<Vec<String>>,
    queries: Cell<usize>,
    fail_verb: Option<String>,
    clone_without_mac: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guest(self, name: &str, running: bool) -> Self {
        self.guests.borrow_mut().insert(
            name.to_string(),
            MockGuest {
                running,
                mac: Some("52:54:00:00:00:01".to_string()),
            },
        );
        self
    }

    /// Make every call of `verb` fail with a backend error.
    pub fn failing(mut self, verb: &str) -> Self {
        self.fail_verb = Some(verb.to_string());
        self
    }

    /// Clones come out without a generated MAC.
    pub fn without_macs(mut self) -> Self {
        self.clone_without_mac = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(verb))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.borrow().len() + self.queries.get()
    }

    fn record(&self, verb: &str, args: &[&str]) -> SpawnResult<()> {
        self.calls
            .borrow_mut()
            .push(format!("{} {}", verb, args.join(" ")));
        if self.fail_verb.as_deref() == Some(verb) {
            return Err(SpawnError::backend(verb, args[0], "mock failure"));
        }
        Ok(())
    }
}

impl GuestBackend for MockBackend {
    fn kind(&self) -> &'static str {
        "mock"
    }

    fn list(&self) -> SpawnResult<BTreeSet<String>> {
        self.queries.set(self.queries.get() + 1);
        Ok(self.guests.borrow().keys().cloned().collect())
    }

    fn is_running(&self, name: &str) -> SpawnResult<bool> {
        self.queries.set(self.queries.get() + 1);
        Ok(self
            .guests
            .borrow()
            .get(name)
            .is_some_and(|g| g.running))
    }

    fn clone_guest(&self, source: &str, dest: &str) -> SpawnResult<()> {
        self.record("clone", &[source, dest])?;
        let mut guests = self.guests.borrow_mut();
        if !guests.contains_key(source) || guests.contains_key(dest) {
            return Err(SpawnError::backend("clone", dest, "bad clone"));
        }
        let n = guests.len() as u8;
        let mac = (!self.clone_without_mac).then(|| format!("52:54:00:aa:bb:{:02x}", n));
        guests.insert(dest.to_string(), MockGuest { running: false, mac });
        Ok(())
    }

    fn start(&self, name: &str) -> SpawnResult<()> {
        self.record("start", &[name])?;
        match self.guests.borrow_mut().get_mut(name) {
            Some(g) => {
                g.running = true;
                Ok(())
            }
            None => Err(SpawnError::backend("start", name, "not defined")),
        }
    }

    fn stop(&self, name: &str) -> SpawnResult<()> {
        self.record("stop", &[name])?;
        match self.guests.borrow_mut().get_mut(name) {
            Some(g) => {
                g.running = false;
                Ok(())
            }
            None => Err(SpawnError::backend("stop", name, "not defined")),
        }
    }

    fn read_generated_address(&self, name: &str, kind: AddressKind) -> SpawnResult<String> {
        self.record("read_mac", &[name])?;
        self.guests
            .borrow()
            .get(name)
            .and_then(|g| g.mac.clone())
            .ok_or_else(|| SpawnError::not_found(name, &kind.to_string()))
    }
}

/// Probe answering from a script, then repeating a fallback.
pub struct ScriptedProbe {
    script: Vec<bool>,
    fallback: bool,
    calls: Cell<u64>,
}

impl ScriptedProbe {
    pub fn new(script: &[bool]) -> Self {
        Self {
            script: script.to_vec(),
            fallback: script.last().copied().unwrap_or(false),
            calls: Cell::new(0),
        }
    }

    pub fn always(ok: bool) -> Self {
        Self {
            script: Vec::new(),
            fallback: ok,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.get()
    }
}

impl Probe for ScriptedProbe {
    fn probe(&self, _target: Ipv4Addr) -> bool {
        let i = self.calls.get() as usize;
        self.calls.set(self.calls.get() + 1);
        self.script.get(i).copied().unwrap_or(self.fallback)
    }
}

/// Channel recording scripts and pushed files.
///
/// Pushes are stored as `(local, remote_path, content)`; content is read at
/// push time because callers may push temp files.
#[derive(Default)]
pub struct RecordingChannel {
    runs: RefCell<Vec<String>>,
    pushes: RefCell<Vec<(String, String, String)>>,
    responses: Vec<(String, String)>,
    fail_prefix: Option<String>,
}

impl RecordingChannel {
    /// Answer scripts starting with `prefix`.
    pub fn respond(mut self, prefix: &str, output: &str) -> Self {
        self.responses.push((prefix.to_string(), output.to_string()));
        self
    }

    /// Fail scripts starting with `prefix`.
    pub fn failing(mut self, prefix: &str) -> Self {
        self.fail_prefix = Some(prefix.to_string());
        self
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.borrow().clone()
    }

    pub fn pushes(&self) -> Vec<(String, String, String)> {
        self.pushes.borrow().clone()
    }
}

impl RemoteChannel for RecordingChannel {
    fn push_file(&self, _target: &GuestTarget, local: &Path, remote_path: &str) -> SpawnResult<()> {
        let content = std::fs::read_to_string(local)?;
        self.pushes.borrow_mut().push((
            local.display().to_string(),
            remote_path.to_string(),
            content,
        ));
        Ok(())
    }

    fn run(&self, target: &GuestTarget, script: &str) -> SpawnResult<String> {
        self.runs.borrow_mut().push(script.to_string());
        if let Some(prefix) = &self.fail_prefix
            && script.starts_with(prefix.as_str())
        {
            return Err(SpawnError::remote("exec", &target.to_string(), "mock failure"));
        }
        Ok(self
            .responses
            .iter()
            .find(|(p, _)| script.starts_with(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

/// Daemon counting reloads; clones share the counter.
#[derive(Clone, Default)]
pub struct CountingDaemon {
    reloads: Rc<Cell<u32>>,
}

impl CountingDaemon {
    pub fn reloads(&self) -> u32 {
        self.reloads.get()
    }
}

impl DhcpDaemon for CountingDaemon {
    fn reload(&self) -> SpawnResult<()> {
        self.reloads.set(self.reloads.get() + 1);
        Ok(())
    }
}

/// Default config rooted in `dir` with every manifest file present.
pub fn provisioned_config(dir: &Path) -> SpawnConfig {
    let mut config = SpawnConfig::default();
    config.state_dir = dir.join("state");
    config.network.lease_file = dir.join("dnsmasq.leases");
    config.network.reservation_file = dir.join("reservations.csv");
    config.vm.manifest_dir = dir.join("provision/vm");
    config.ct.manifest_dir = dir.join("provision/ct");
    for profile in [&config.vm, &config.ct] {
        for rel in &profile.manifest {
            let path = profile.manifest_dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, format!("# {}\n", rel)).unwrap();
        }
    }
    config
}
