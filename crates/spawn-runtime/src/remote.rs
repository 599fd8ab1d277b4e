//! Remote execution channels into a freshly started guest.

use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};

use spawn_core::config::{LxcConfig, RemoteConfig, SpawnConfig};
use spawn_core::guest::GuestRole;
use spawn_core::{SpawnError, SpawnResult};
use tracing::{debug, instrument};

use crate::shell::{run_host_stdout, shell_quote};

/// Where a remote call lands: the guest name plus its current address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestTarget {
    pub name: String,
    pub address: Ipv4Addr,
}

impl GuestTarget {
    pub fn new(name: &str, address: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            address,
        }
    }
}

impl std::fmt::Display for GuestTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// File transfer and script execution inside a guest.
pub trait RemoteChannel {
    /// Copy a host file to an absolute path in the guest, creating parents.
    fn push_file(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> SpawnResult<()>;

    /// Run a `bash` script in the guest and return its trimmed stdout.
    fn run(&self, target: &GuestTarget, script: &str) -> SpawnResult<String>;
}

fn remote_parent(remote_path: &str) -> Option<&str> {
    let (parent, _) = remote_path.rsplit_once('/')?;
    (!parent.is_empty()).then_some(parent)
}

/// SSH/SCP against the guest address, never prompting.
pub struct SshChannel {
    config: RemoteConfig,
}

impl SshChannel {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> Vec<String> {
        let mut opts: Vec<String> = [
            "BatchMode=yes",
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ]
        .iter()
        .flat_map(|o| ["-o".to_string(), o.to_string()])
        .collect();
        opts.push("-o".to_string());
        opts.push(format!("ConnectTimeout={}", self.config.connect_timeout_secs));
        if let Some(identity) = &self.config.identity_file {
            opts.push("-i".to_string());
            opts.push(identity.display().to_string());
        }
        opts
    }

    fn destination(&self, target: &GuestTarget) -> String {
        format!("{}@{}", self.config.user, target.address)
    }
}

impl RemoteChannel for SshChannel {
    #[instrument(skip(self), fields(guest = %target.name))]
    fn push_file(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> SpawnResult<()> {
        if let Some(parent) = remote_parent(remote_path) {
            self.run(target, &format!("mkdir -p {}", shell_quote(parent)))?;
        }
        let local_str = local.display().to_string();
        let dest = format!("{}:{}", self.destination(target), remote_path);
        let opts = self.options();
        let mut args: Vec<&str> = opts.iter().map(String::as_str).collect();
        args.push("-q");
        args.push(&local_str);
        args.push(&dest);
        run_host_stdout("scp", &args)
            .map_err(|e| SpawnError::remote("push", &target.to_string(), format!("{:#}", e)))?;
        debug!(remote_path, "pushed");
        Ok(())
    }

    fn run(&self, target: &GuestTarget, script: &str) -> SpawnResult<String> {
        let dest = self.destination(target);
        let remote_cmd = format!("bash -c {}", shell_quote(script));
        let opts = self.options();
        let mut args: Vec<&str> = opts.iter().map(String::as_str).collect();
        args.push(&dest);
        args.push(&remote_cmd);
        run_host_stdout("ssh", &args)
            .map_err(|e| SpawnError::remote("exec", &target.to_string(), format!("{:#}", e)))
    }
}

/// `lxc-attach` for scripts; pushes write straight into the container rootfs.
pub struct LxcAttachChannel {
    config: LxcConfig,
}

impl LxcAttachChannel {
    pub fn new(config: LxcConfig) -> Self {
        Self { config }
    }

    /// Host path of `remote_path` inside the container's rootfs.
    pub fn rootfs_path(&self, name: &str, remote_path: &str) -> SpawnResult<PathBuf> {
        let rel = Path::new(remote_path);
        if !rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SpawnError::remote(
                "push",
                name,
                format!("guest path must be absolute without '..': {}", remote_path),
            ));
        }
        let mut path = self.config.lxc_path.join(name).join("rootfs");
        path.extend(rel.components().filter(|c| matches!(c, Component::Normal(_))));
        Ok(path)
    }
}

impl RemoteChannel for LxcAttachChannel {
    #[instrument(skip(self), fields(guest = %target.name))]
    fn push_file(&self, target: &GuestTarget, local: &Path, remote_path: &str) -> SpawnResult<()> {
        let dest = self.rootfs_path(&target.name, remote_path)?;
        let wrap = |e: std::io::Error| {
            SpawnError::remote("push", &target.to_string(), format!("{}: {}", dest.display(), e))
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(wrap)?;
        }
        std::fs::copy(local, &dest).map_err(wrap)?;
        debug!(remote_path, "copied into rootfs");
        Ok(())
    }

    fn run(&self, target: &GuestTarget, script: &str) -> SpawnResult<String> {
        let lxc_path = self.config.lxc_path.display().to_string();
        run_host_stdout(
            "lxc-attach",
            &["-P", &lxc_path, "-n", &target.name, "--", "bash", "-c", script],
        )
        .map_err(|e| SpawnError::remote("exec", &target.to_string(), format!("{:#}", e)))
    }
}

/// Pick the channel for a role.
pub fn channel_for(role: GuestRole, config: &SpawnConfig) -> Box<dyn RemoteChannel> {
    match role {
        GuestRole::Vm => Box::new(SshChannel::new(config.remote.clone())),
        GuestRole::Ct => Box::new(LxcAttachChannel::new(config.backends.lxc.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell_mock::{self, MockResponse};

    fn target() -> GuestTarget {
        GuestTarget::new("vm000002", Ipv4Addr::new(192, 168, 112, 250))
    }

    #[test]
    fn test_ssh_run_is_non_interactive() {
        let (_guard, calls) = shell_mock::mock_commands()
            .on("ssh", MockResponse::ok("yes\n"))
            .install();
        let ch = SshChannel::new(RemoteConfig {
            identity_file: Some(PathBuf::from("/root/.ssh/spawn")),
            ..RemoteConfig::default()
        });
        let out = ch.run(&target(), "test -f /x && echo yes").unwrap();
        assert_eq!(out, "yes");

        let calls = calls.lock().unwrap();
        let line = &calls[0];
        assert!(line.starts_with("ssh -o BatchMode=yes"), "{}", line);
        assert!(line.contains("-i /root/.ssh/spawn"), "{}", line);
        assert!(line.contains("ConnectTimeout=5"), "{}", line);
        assert!(line.contains("root@192.168.112.250 bash -c 'test -f /x && echo yes'"), "{}", line);
    }

    #[test]
    fn test_ssh_push_creates_parent() {
        let (_guard, calls) = shell_mock::mock_commands().install();
        let ch = SshChannel::new(RemoteConfig::default());
        ch.push_file(&target(), Path::new("/opt/p/scripts/a.sh"), "/root/spawn/scripts/a.sh")
            .unwrap();
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("bash -c 'mkdir -p '\\''/root/spawn/scripts'\\'''"), "{}", calls[0]);
        assert!(calls[1].starts_with("scp "));
        assert!(
            calls[1].ends_with("-q /opt/p/scripts/a.sh root@192.168.112.250:/root/spawn/scripts/a.sh")
        );
    }

    #[test]
    fn test_ssh_failure_is_remote_error() {
        let (_guard, _calls) = shell_mock::mock_commands()
            .on("ssh", MockResponse::fail(255, "Connection refused"))
            .install();
        let ch = SshChannel::new(RemoteConfig::default());
        match ch.run(&target(), "true").unwrap_err() {
            SpawnError::Remote { action, message, .. } => {
                assert_eq!(action, "exec");
                assert!(message.contains("Connection refused"));
            }
            other => panic!("expected Remote, got {:?}", other),
        }
    }

    #[test]
    fn test_lxc_push_writes_into_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("later.sh");
        std::fs::write(&src, "#!/bin/bash\n").unwrap();
        let ch = LxcAttachChannel::new(LxcConfig {
            lxc_path: dir.path().join("lxc"),
        });
        let t = GuestTarget::new("ct000003", Ipv4Addr::new(192, 168, 112, 251));
        ch.push_file(&t, &src, "/root/later.sh").unwrap();
        let copied = dir.path().join("lxc/ct000003/rootfs/root/later.sh");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "#!/bin/bash\n");
    }

    #[test]
    fn test_lxc_rootfs_path_rejects_escape() {
        let ch = LxcAttachChannel::new(LxcConfig {
            lxc_path: PathBuf::from("/var/lib/lxc"),
        });
        assert!(ch.rootfs_path("ct1", "/root/../../etc/passwd").is_err());
        assert!(ch.rootfs_path("ct1", "root/x").is_err());
        assert_eq!(
            ch.rootfs_path("ct1", "/etc/hostname").unwrap(),
            PathBuf::from("/var/lib/lxc/ct1/rootfs/etc/hostname")
        );
    }

    #[test]
    fn test_lxc_run_uses_attach() {
        let (_guard, calls) = shell_mock::mock_commands().install();
        let ch = LxcAttachChannel::new(LxcConfig {
            lxc_path: PathBuf::from("/var/lib/lxc"),
        });
        let t = GuestTarget::new("ct000003", Ipv4Addr::new(192, 168, 112, 251));
        ch.run(&t, "hostname").unwrap();
        assert_eq!(
            calls.lock().unwrap()[0],
            "lxc-attach -P /var/lib/lxc -n ct000003 -- bash -c hostname"
        );
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/root/spawn/a.sh"), Some("/root/spawn"));
        assert_eq!(remote_parent("/a.sh"), None);
        assert_eq!(remote_parent("a.sh"), None);
    }
}
