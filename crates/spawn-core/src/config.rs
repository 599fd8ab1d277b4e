use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::guest::GuestRole;
use crate::lease::NetworkPrefix;
use crate::manifest::ProvisioningManifest;
use crate::naming::validate_guest_name;

/// Default config location when neither `--config` nor the env var is set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/spawnctl/spawnctl.toml";
/// Env var overriding the config location.
pub const CONFIG_ENV: &str = "SPAWNCTL_CONFIG";

/// Top-level configuration, threaded explicitly through every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnConfig {
    /// Lock files live here.
    pub state_dir: PathBuf,
    pub network: NetworkConfig,
    pub remote: RemoteConfig,
    pub vm: GuestProfile,
    pub ct: GuestProfile,
    pub backends: BackendsConfig,
    pub customize: CustomizeConfig,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/spawnctl"),
            network: NetworkConfig::default(),
            remote: RemoteConfig::default(),
            vm: GuestProfile {
                base_name: "BaseVM".to_string(),
                pre_base_name: "BaseVM-Pre".to_string(),
                bootstrap_ip: Ipv4Addr::new(192, 168, 112, 250),
                manifest_dir: PathBuf::from("/opt/spawnctl/provision/vm"),
                manifest: default_manifest(),
                build_script: default_build_script(),
                bootstrap_unit: default_bootstrap_unit(),
                network_file: default_network_file(),
            },
            ct: GuestProfile {
                base_name: "BaseCT".to_string(),
                pre_base_name: "BaseCT-Pre".to_string(),
                bootstrap_ip: Ipv4Addr::new(192, 168, 112, 251),
                manifest_dir: PathBuf::from("/opt/spawnctl/provision/ct"),
                manifest: default_manifest(),
                build_script: default_build_script(),
                bootstrap_unit: default_bootstrap_unit(),
                network_file: default_network_file(),
            },
            backends: BackendsConfig::default(),
            customize: CustomizeConfig::default(),
        }
    }
}

/// DHCP/DNS and reachability settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// First three octets of the guest network.
    pub prefix: NetworkPrefix,
    /// Highest allocatable host offset (inclusive).
    pub max_offset: u8,
    /// dnsmasq leases file.
    pub lease_file: PathBuf,
    /// dnsmasq `dhcp-hostsfile` holding `mac,ip,name` lines.
    pub reservation_file: PathBuf,
    /// Process name signaled with SIGHUP after a reservation is written.
    pub daemon: String,
    pub reachability_timeout_secs: u64,
    pub required_successes: u32,
    /// Extra seconds allowed past the nominal timeout for tick granularity.
    pub grace_secs: u64,
    /// Tick length between probes.
    pub probe_interval_ms: u64,
    pub lease_timeout_secs: u64,
    pub lease_poll_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            prefix: NetworkPrefix::new(192, 168, 112),
            max_offset: 248,
            lease_file: PathBuf::from("/var/lib/misc/dnsmasq.leases"),
            reservation_file: PathBuf::from("/etc/dnsmasq.d/reservations.csv"),
            daemon: "dnsmasq".to_string(),
            reachability_timeout_secs: 60,
            required_successes: 4,
            grace_secs: 2,
            probe_interval_ms: 1000,
            lease_timeout_secs: 180,
            lease_poll_secs: 2,
        }
    }
}

/// Control channel into guests (SSH for VMs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Guest directory receiving the provisioning manifest.
    pub remote_dir: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            identity_file: None,
            connect_timeout_secs: 5,
            remote_dir: "/root/spawn".to_string(),
        }
    }
}

/// Per-role base image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestProfile {
    /// Golden image cloned for every new guest.
    pub base_name: String,
    /// Template the golden image is built from.
    pub pre_base_name: String,
    /// Static address the base (and fresh clones) come up on.
    pub bootstrap_ip: Ipv4Addr,
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: Vec<String>,
    /// Manifest entry executed on the guest to build the base.
    #[serde(default = "default_build_script")]
    pub build_script: String,
    /// Systemd unit enabled only for bootstrap; removed by the later script.
    #[serde(default = "default_bootstrap_unit")]
    pub bootstrap_unit: String,
    /// Static network file dropped when the guest switches to DHCP.
    #[serde(default = "default_network_file")]
    pub network_file: String,
}

impl GuestProfile {
    pub fn manifest(&self) -> ProvisioningManifest {
        ProvisioningManifest::new(&self.manifest_dir, &self.manifest)
    }
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("/opt/spawnctl/provision")
}

fn default_manifest() -> Vec<String> {
    [
        "scripts/network.sh",
        "scripts/firewall.sh",
        "scripts/mount.sh",
        "systemd/firstboot.service",
        "scripts/guest_driver.sh",
        "scripts/basebuild.sh",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_build_script() -> String {
    "scripts/basebuild.sh".to_string()
}

fn default_bootstrap_unit() -> String {
    "firstboot.service".to_string()
}

fn default_network_file() -> String {
    "/etc/systemd/network/10-bootstrap.network".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub vm_manager: VmManagerConfig,
    pub lxc: LxcConfig,
}

/// QEMU guests driven through the `vm_manager` CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmManagerConfig {
    pub command: String,
    /// Per-guest `<name>.conf` files written by `vm_manager`.
    pub conf_dir: PathBuf,
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            command: "vm_manager".to_string(),
            conf_dir: PathBuf::from("/etc/vm_manager/vms"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LxcConfig {
    pub lxc_path: PathBuf,
}

impl Default for LxcConfig {
    fn default() -> Self {
        Self {
            lxc_path: PathBuf::from("/var/lib/lxc"),
        }
    }
}

/// Post-clone customization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizeConfig {
    /// Custom Tera template for the later script. Bundled one when unset.
    pub later_template: Option<PathBuf>,
    /// Guest path of the later script.
    pub later_path: String,
    /// Guest path of the bootstrap-once completion marker.
    pub marker: String,
    /// Command the later script uses to bring up the DHCP network.
    pub network_reload: String,
}

impl Default for CustomizeConfig {
    fn default() -> Self {
        Self {
            later_template: None,
            later_path: "/root/later.sh".to_string(),
            marker: "/var/lib/spawnctl/bootstrap.done".to_string(),
            network_reload: "systemctl restart systemd-networkd".to_string(),
        }
    }
}

impl SpawnConfig {
    /// Resolve the config path: explicit > `$SPAWNCTL_CONFIG` > default.
    pub fn resolve_path(explicit: Option<&Path>) -> (PathBuf, bool) {
        if let Some(p) = explicit {
            return (p.to_path_buf(), true);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Load and validate the config.
    ///
    /// An explicitly named file must exist; a missing default file yields
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = Self::resolve_path(explicit);
        if !path.exists() {
            if required {
                bail!("Config file not found: {}", path.display());
            }
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn profile(&self, role: GuestRole) -> &GuestProfile {
        match role {
            GuestRole::Vm => &self.vm,
            GuestRole::Ct => &self.ct,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let net = &self.network;
        if !(2..=254).contains(&net.max_offset) {
            bail!("network.max_offset must be within 2..=254, got {}", net.max_offset);
        }
        if net.required_successes == 0 {
            bail!("network.required_successes must be at least 1");
        }
        if net.reachability_timeout_secs < u64::from(net.required_successes) {
            bail!(
                "network.reachability_timeout_secs ({}) is shorter than required_successes ({}) probes",
                net.reachability_timeout_secs,
                net.required_successes
            );
        }
        if net.lease_poll_secs == 0 {
            bail!("network.lease_poll_secs must be at least 1");
        }
        if net.daemon.trim().is_empty() {
            bail!("network.daemon must name the DHCP/DNS process");
        }

        for (role, profile) in [(GuestRole::Vm, &self.vm), (GuestRole::Ct, &self.ct)] {
            validate_guest_name(&profile.base_name)
                .with_context(|| format!("[{}] base_name", role))?;
            validate_guest_name(&profile.pre_base_name)
                .with_context(|| format!("[{}] pre_base_name", role))?;
            if profile.base_name == profile.pre_base_name {
                bail!("[{}] base_name and pre_base_name must differ", role);
            }
            if !profile.manifest.iter().any(|m| m == &profile.build_script) {
                bail!(
                    "[{}] build_script {:?} must be listed in the manifest",
                    role,
                    profile.build_script
                );
            }
            if profile.manifest.iter().any(|m| Path::new(m).is_absolute() || m.contains("..")) {
                bail!("[{}] manifest entries must be relative paths without '..'", role);
            }
        }
        Ok(())
    }
}
