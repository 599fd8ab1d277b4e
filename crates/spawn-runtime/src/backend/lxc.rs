use std::collections::BTreeSet;
use std::path::PathBuf;

use spawn_core::config::LxcConfig;
use spawn_core::guest::GuestState;
use spawn_core::naming::normalize_mac;
use spawn_core::{SpawnError, SpawnResult};
use tracing::{debug, info, instrument};

use super::{AddressKind, GuestBackend, check_clone_preconditions, parse_name_lines};
use crate::shell::run_host_stdout;

const HWADDR_KEY: &str = "lxc.net.0.hwaddr";

/// System containers managed by the LXC userspace tools.
pub struct LxcBackend {
    config: LxcConfig,
}

impl LxcBackend {
    pub fn new(config: LxcConfig) -> Self {
        Self { config }
    }

    fn lxc_path(&self) -> String {
        self.config.lxc_path.display().to_string()
    }

    /// Path of a container's config file on the host.
    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config.lxc_path.join(name).join("config")
    }

    fn run(&self, verb: &str, guest: &str, cmd: &str, args: &[&str]) -> SpawnResult<String> {
        let lxc_path = self.lxc_path();
        let mut full: Vec<&str> = vec!["-P", &lxc_path];
        full.extend_from_slice(args);
        run_host_stdout(cmd, &full).map_err(|e| SpawnError::backend(verb, guest, format!("{:#}", e)))
    }
}

/// Extract the value of `key` from an LXC config (`key = value` lines).
pub(crate) fn config_value(text: &str, key: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl GuestBackend for LxcBackend {
    fn kind(&self) -> &'static str {
        "lxc"
    }

    fn list(&self) -> SpawnResult<BTreeSet<String>> {
        let output = self.run("list", "*", "lxc-ls", &["-1"])?;
        Ok(parse_name_lines(&output))
    }

    fn is_running(&self, name: &str) -> SpawnResult<bool> {
        let output = self.run("info", name, "lxc-info", &["-s", "-n", name])?;
        Ok(output
            .lines()
            .any(|l| l.trim_start().starts_with("State:") && l.contains("RUNNING")))
    }

    #[instrument(skip(self))]
    fn clone_guest(&self, source: &str, dest: &str) -> SpawnResult<()> {
        check_clone_preconditions(self, source, dest)?;
        if self.is_running(source)? {
            return Err(SpawnError::backend(
                "clone",
                source,
                "source container is running; stop it before cloning",
            ));
        }
        info!(source, dest, "Copying container");
        self.run("clone", dest, "lxc-copy", &["-n", source, "-N", dest])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn start(&self, name: &str) -> SpawnResult<()> {
        match self.state(name)? {
            GuestState::Absent => Err(SpawnError::backend("start", name, "container is not defined")),
            GuestState::Running => {
                debug!(guest = name, "Already running");
                Ok(())
            }
            GuestState::Stopped => {
                self.run("start", name, "lxc-start", &["-n", name])?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    fn stop(&self, name: &str) -> SpawnResult<()> {
        match self.state(name)? {
            GuestState::Absent => Err(SpawnError::backend("stop", name, "container is not defined")),
            GuestState::Stopped => {
                debug!(guest = name, "Already stopped");
                Ok(())
            }
            GuestState::Running => {
                self.run("stop", name, "lxc-stop", &["-n", name])?;
                Ok(())
            }
        }
    }

    fn read_generated_address(&self, name: &str, kind: AddressKind) -> SpawnResult<String> {
        let path = self.config_path(name);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| SpawnError::not_found(name, &format!("config {}", path.display())))?;
        match kind {
            AddressKind::Mac => {
                let raw = config_value(&text, HWADDR_KEY)
                    .ok_or_else(|| SpawnError::not_found(name, &kind.to_string()))?;
                normalize_mac(&raw).map_err(|_| SpawnError::not_found(name, &kind.to_string()))
            }
        }
    }
}
