//! Makes sure the role's base image exists and is a valid clone source.

use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use spawn_core::config::{GuestProfile, SpawnConfig};
use spawn_core::guest::{GuestRole, GuestState};
use spawn_core::manifest::ManifestEntry;
use spawn_core::{SpawnError, SpawnResult};
use tracing::{info, instrument, warn};

use crate::backend::GuestBackend;
use crate::network::ReachabilityMonitor;
use crate::remote::{GuestTarget, RemoteChannel};
use crate::shell::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseOutcome {
    /// The base already existed.
    Reused,
    /// The base was cloned from the pre-base and provisioned.
    Built,
}

/// Snapshot for `base status`.
#[derive(Debug, Clone)]
pub struct BaseStatus {
    pub base_name: String,
    pub base: GuestState,
    pub pre_base_name: String,
    pub pre_base: GuestState,
    pub missing_files: Vec<PathBuf>,
}

/// Exclusive advisory lock serializing base builds per role.
struct BaseLock {
    file: File,
}

impl BaseLock {
    fn acquire(state_dir: &Path, role: GuestRole) -> SpawnResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("base-{}.lock", role.prefix()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            info!(lock = %path.display(), "Another base build is running, waiting");
            file.lock_exclusive()?;
        }
        Ok(Self { file })
    }
}

impl Drop for BaseLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("failed to release base lock: {}", e);
        }
    }
}

/// Fail if something already answers on a bootstrap address.
///
/// Every fresh clone comes up on the same address, so a leftover guest would
/// otherwise be mistaken for the new one.
pub(crate) fn ensure_address_free(
    monitor: &ReachabilityMonitor<'_>,
    ip: Ipv4Addr,
) -> SpawnResult<()> {
    if monitor.is_answering(ip) {
        return Err(SpawnError::Config(format!(
            "bootstrap address {} already answers; stop the guest holding it first",
            ip
        )));
    }
    Ok(())
}

pub struct BaseImageEnsurer<'a> {
    role: GuestRole,
    config: &'a SpawnConfig,
    backend: &'a dyn GuestBackend,
    channel: &'a dyn RemoteChannel,
    monitor: &'a ReachabilityMonitor<'a>,
}

impl<'a> BaseImageEnsurer<'a> {
    pub fn new(
        role: GuestRole,
        config: &'a SpawnConfig,
        backend: &'a dyn GuestBackend,
        channel: &'a dyn RemoteChannel,
        monitor: &'a ReachabilityMonitor<'a>,
    ) -> Self {
        Self {
            role,
            config,
            backend,
            channel,
            monitor,
        }
    }

    fn profile(&self) -> &GuestProfile {
        self.config.profile(self.role)
    }

    pub fn status(&self) -> SpawnResult<BaseStatus> {
        let profile = self.profile();
        let missing_files = match profile.manifest().check() {
            Ok(_) => Vec::new(),
            Err(SpawnError::MissingFile { missing }) => missing,
            Err(e) => return Err(e),
        };
        Ok(BaseStatus {
            base_name: profile.base_name.clone(),
            base: self.backend.state(&profile.base_name)?,
            pre_base_name: profile.pre_base_name.clone(),
            pre_base: self.backend.state(&profile.pre_base_name)?,
            missing_files,
        })
    }

    /// Ensure the base exists and is stopped.
    ///
    /// The manifest is checked before anything touches the backend.
    #[instrument(skip(self), fields(role = %self.role))]
    pub fn ensure(&self) -> SpawnResult<BaseOutcome> {
        let profile = self.profile();
        let entries = profile.manifest().check()?;

        let _lock = BaseLock::acquire(&self.config.state_dir, self.role)?;

        match self.backend.state(&profile.base_name)? {
            GuestState::Stopped => {
                info!(base = %profile.base_name, "Reusing base image");
                Ok(BaseOutcome::Reused)
            }
            GuestState::Running => {
                info!(base = %profile.base_name, "Base image running, stopping it for cloning");
                self.backend.stop(&profile.base_name)?;
                Ok(BaseOutcome::Reused)
            }
            GuestState::Absent => {
                self.build(profile, &entries)?;
                Ok(BaseOutcome::Built)
            }
        }
    }

    fn build(&self, profile: &GuestProfile, entries: &[ManifestEntry]) -> SpawnResult<()> {
        let base = profile.base_name.as_str();
        let pre = profile.pre_base_name.as_str();
        info!(base, pre, "Building base image");

        if self.backend.state(pre)? == GuestState::Running {
            self.backend.stop(pre)?;
        }
        self.backend.clone_guest(pre, base)?;
        ensure_address_free(self.monitor, profile.bootstrap_ip)?;
        self.backend.start(base)?;

        let net = &self.config.network;
        self.monitor.await_reachable(
            profile.bootstrap_ip,
            net.reachability_timeout_secs,
            net.required_successes,
            base,
        )?;

        let target = GuestTarget::new(base, profile.bootstrap_ip);
        let remote_dir = self.config.remote.remote_dir.trim_end_matches('/');
        for entry in entries {
            let remote_path = format!("{}/{}", remote_dir, entry.relative.to_string_lossy());
            self.channel.push_file(&target, &entry.local, &remote_path)?;
        }
        info!(files = entries.len(), "Provisioning files pushed");

        let build = format!(
            "cd {} && bash {}",
            shell_quote(remote_dir),
            shell_quote(&profile.build_script)
        );
        self.channel.run(&target, &build)?;
        // vm_manager stops with SIGTERM to QEMU; flush before the image is frozen.
        self.channel.run(&target, "sync")?;

        self.backend.stop(base)?;
        info!(base, "Base image ready");
        Ok(())
    }
}
