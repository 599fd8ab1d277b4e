use spawn_core::{SpawnError, SpawnResult};
use tracing::info;

use crate::shell::run_host;

/// The DHCP/DNS service that reads the reservation store.
pub trait DhcpDaemon {
    /// Ask the daemon to re-read its host files.
    fn reload(&self) -> SpawnResult<()>;
}

/// Reload by `SIGHUP` to the named process (dnsmasq re-reads
/// `dhcp-hostsfile` on HUP).
pub struct SignalDaemon {
    process: String,
}

impl SignalDaemon {
    pub fn new(process: &str) -> Self {
        Self {
            process: process.to_string(),
        }
    }
}

impl DhcpDaemon for SignalDaemon {
    fn reload(&self) -> SpawnResult<()> {
        let output = run_host("pkill", &["-HUP", "-x", &self.process])
            .map_err(|e| SpawnError::backend("reload", &self.process, format!("{:#}", e)))?;
        match output.status.code() {
            Some(0) => {
                info!(daemon = %self.process, "Sent SIGHUP");
                Ok(())
            }
            Some(1) => Err(SpawnError::backend(
                "reload",
                &self.process,
                "no running process matched",
            )),
            _ => Err(SpawnError::backend(
                "reload",
                &self.process,
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        }
    }
}
