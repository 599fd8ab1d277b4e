use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use spawn_core::config::VmManagerConfig;
use spawn_core::guest::GuestState;
use spawn_core::naming::{normalize_mac, validate_guest_name};
use spawn_core::{SpawnError, SpawnResult};
use tracing::{debug, info, instrument};

use super::{AddressKind, GuestBackend, check_clone_preconditions};
use crate::shell::run_host_stdout;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid regex"));

/// QEMU guests managed by the `vm_manager` CLI.
///
/// `list` prints one `- <name> [STATUS] ...` row per defined guest; each
/// guest has an INI config at `<conf_dir>/<name>.conf` whose `[VM]`
/// section carries the generated `mac`.
pub struct VmManagerBackend {
    config: VmManagerConfig,
}

/// One row of `vm_manager list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEntry {
    pub name: String,
    pub running: bool,
}

impl VmManagerBackend {
    pub fn new(config: VmManagerConfig) -> Self {
        Self { config }
    }

    fn conf_path(&self, name: &str) -> PathBuf {
        self.config.conf_dir.join(format!("{}.conf", name))
    }

    fn run(&self, verb: &str, guest: &str, args: &[&str]) -> SpawnResult<String> {
        run_host_stdout(&self.config.command, args)
            .map_err(|e| SpawnError::backend(verb, guest, format!("{:#}", e)))
    }

    pub fn entries(&self) -> SpawnResult<Vec<VmEntry>> {
        let output = self.run("list", "*", &["list"])?;
        Ok(parse_list_output(&output))
    }
}

/// Parse `vm_manager list` output, ignoring headers and color codes.
pub fn parse_list_output(output: &str) -> Vec<VmEntry> {
    let plain = ANSI_RE.replace_all(output, "");
    plain
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("- ")?;
            let name = rest.split_whitespace().next()?;
            validate_guest_name(name).ok()?;
            Some(VmEntry {
                name: name.to_string(),
                running: rest.contains("[RUNNING"),
            })
        })
        .collect()
}

/// Read `key` from `[section]` of an INI document.
pub(crate) fn ini_value(text: &str, section: &str, key: &str) -> Option<String> {
    let mut in_section = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == section;
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some((k, v)) = line.split_once('=')
            && k.trim().eq_ignore_ascii_case(key)
        {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

impl GuestBackend for VmManagerBackend {
    fn kind(&self) -> &'static str {
        "vm_manager"
    }

    fn list(&self) -> SpawnResult<BTreeSet<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.name).collect())
    }

    fn is_running(&self, name: &str) -> SpawnResult<bool> {
        Ok(self
            .entries()?
            .iter()
            .any(|e| e.name == name && e.running))
    }

    #[instrument(skip(self))]
    fn clone_guest(&self, source: &str, dest: &str) -> SpawnResult<()> {
        check_clone_preconditions(self, source, dest)?;
        if self.is_running(source)? {
            return Err(SpawnError::backend(
                "clone",
                source,
                "source guest is running; stop it before cloning",
            ));
        }
        info!(source, dest, "Cloning guest (disk copy may take a while)");
        self.run("clone", dest, &["copy", source, dest])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn start(&self, name: &str) -> SpawnResult<()> {
        match self.state(name)? {
            GuestState::Absent => Err(SpawnError::backend(
                "start",
                name,
                "guest is not defined",
            )),
            GuestState::Running => {
                debug!(guest = name, "Already running");
                Ok(())
            }
            GuestState::Stopped => {
                self.run("start", name, &["run", name, "--headless"])?;
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    fn stop(&self, name: &str) -> SpawnResult<()> {
        match self.state(name)? {
            GuestState::Absent => Err(SpawnError::backend(
                "stop",
                name,
                "guest is not defined",
            )),
            GuestState::Stopped => {
                debug!(guest = name, "Already stopped");
                Ok(())
            }
            GuestState::Running => {
                self.run("stop", name, &["stop", name])?;
                Ok(())
            }
        }
    }

    fn read_generated_address(&self, name: &str, kind: AddressKind) -> SpawnResult<String> {
        let path = self.conf_path(name);
        let text = std::fs::read_to_string(&path)
            .map_err(|_| SpawnError::not_found(name, &format!("config {}", path.display())))?;
        match kind {
            AddressKind::Mac => {
                let raw = ini_value(&text, "VM", "mac")
                    .ok_or_else(|| SpawnError::not_found(name, &kind.to_string()))?;
                normalize_mac(&raw).map_err(|_| SpawnError::not_found(name, &kind.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock::{self, MockResponse};

    const LIST: &str = "\
\x1b[32m*\x1b[0m INFO: Encontrada(s) 3 VM(s) definida(s):
  \x1b[36mGUEST NAME          \x1b[0m STATUS             DETAILS
  ---------------------------------------------------------------
  - Base-Pre             [\x1b[31mSTOPPED\x1b[0m] 2G RAM, 2 Cores
  - vm000002             [\x1b[32mRUNNING\x1b[0m] 2G RAM, 2 Cores (PID: 4242)
  - vm000004             [\x1b[33mSTALE_PID\x1b[0m] 2G RAM, 2 Cores (Stale PID)
";

    fn backend(conf_dir: PathBuf) -> VmManagerBackend {
        VmManagerBackend::new(VmManagerConfig {
            command: "vm_manager".to_string(),
            conf_dir,
        })
    }

    #[test]
    fn test_parse_list_output() {
        let entries = parse_list_output(LIST);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "Base-Pre");
        assert!(!entries[0].running);
        assert!(entries[1].running);
        assert!(!entries[2].running, "stale pid is not running");
    }

    #[test]
    fn test_exact_token_exists() {
        let (_guard, _calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        assert!(b.exists("Base-Pre").unwrap());
        assert!(!b.exists("Base").unwrap());
        assert!(!b.exists("vm00000").unwrap());
    }

    #[test]
    fn test_empty_list_is_not_an_error() {
        let (_guard, _calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(""))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        assert!(b.list().unwrap().is_empty());
    }

    #[test]
    fn test_state() {
        let (_guard, _calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        assert_eq!(b.state("vm000002").unwrap(), GuestState::Running);
        assert_eq!(b.state("Base-Pre").unwrap(), GuestState::Stopped);
        assert_eq!(b.state("Base").unwrap(), GuestState::Absent);
    }

    #[test]
    fn test_clone_issues_copy() {
        let (_guard, calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        b.clone_guest("Base-Pre", "Base").unwrap();
        assert!(
            calls
                .lock()
                .unwrap()
                .contains(&"vm_manager copy Base-Pre Base".to_string())
        );
    }

    #[test]
    fn test_clone_rejects_missing_source_and_existing_dest() {
        let (_guard, calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        assert!(matches!(
            b.clone_guest("Base", "vm999999"),
            Err(SpawnError::Backend { .. })
        ));
        assert!(matches!(
            b.clone_guest("Base-Pre", "vm000004"),
            Err(SpawnError::Backend { .. })
        ));
        assert!(matches!(
            b.clone_guest("vm000002", "vm999999"),
            Err(SpawnError::Backend { .. })
        ));
        assert!(
            !calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("vm_manager copy"))
        );
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let (_guard, calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        b.start("vm000002").unwrap();
        b.stop("Base-Pre").unwrap();
        b.start("Base-Pre").unwrap();
        b.stop("vm000002").unwrap();

        let calls = calls.lock().unwrap();
        let mutating: Vec<&String> = calls.iter().filter(|c| !c.ends_with(" list")).collect();
        assert_eq!(
            mutating,
            vec!["vm_manager run Base-Pre --headless", "vm_manager stop vm000002"]
        );
    }

    #[test]
    fn test_start_failure_is_backend_error() {
        let (_guard, _calls) = shell_mock::mock_commands()
            .on("vm_manager list", MockResponse::ok(LIST))
            .on("vm_manager run", MockResponse::fail(1, "QEMU command failed"))
            .install();
        let b = backend(PathBuf::from("/nonexistent"));
        match b.start("Base-Pre").unwrap_err() {
            SpawnError::Backend { verb, message, .. } => {
                assert_eq!(verb, "start");
                assert!(message.contains("QEMU command failed"));
            }
            other => panic!("expected Backend, got {:?}", other),
        }
        assert!(b.start("Nope").is_err());
    }

    #[test]
    fn test_read_mac_from_conf() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("vm000002.conf"),
            "[VM]\ndisk = /var/lib/libvirt/images/vm000002.qcow2\nmac = 52:54:00:AB:01:02\nsmp = 2\n",
        )
        .unwrap();
        let b = backend(dir.path().to_path_buf());
        assert_eq!(
            b.read_generated_address("vm000002", AddressKind::Mac).unwrap(),
            "52:54:00:ab:01:02"
        );
    }

    #[test]
    fn test_read_mac_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vm000004.conf"), "[VM]\nsmp = 2\n").unwrap();
        let b = backend(dir.path().to_path_buf());
        assert!(matches!(
            b.read_generated_address("vm000004", AddressKind::Mac),
            Err(SpawnError::NotFound { .. })
        ));
        assert!(matches!(
            b.read_generated_address("vm000006", AddressKind::Mac),
            Err(SpawnError::NotFound { .. })
        ));
    }

    #[test]
    fn test_ini_value_respects_section() {
        let text = "[Other]\nmac = 00:00:00:00:00:01\n\n[VM]\n; comment\nMAC=52:54:00:00:00:02\n";
        assert_eq!(ini_value(text, "VM", "mac").as_deref(), Some("52:54:00:00:00:02"));
        assert_eq!(ini_value(text, "VM", "disk"), None);
    }
}
