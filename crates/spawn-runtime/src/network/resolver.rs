use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use spawn_core::config::NetworkConfig;
use spawn_core::guest::LeaseReservation;
use spawn_core::lease::{self, LeaseEntry, NetworkPrefix};
use spawn_core::{SpawnError, SpawnResult};
use tracing::{debug, info, instrument};

use super::daemon::DhcpDaemon;
use super::reachability::CancelToken;

/// Reads the lease table and reservation store, appends reservations, and
/// waits for leases.
pub struct LeaseResolver {
    lease_file: PathBuf,
    reservation_file: PathBuf,
    prefix: NetworkPrefix,
    max_offset: u8,
    poll_secs: u64,
    poll_sleep: Duration,
    daemon: Box<dyn DhcpDaemon>,
    cancel: CancelToken,
}

/// Read a table file; a missing file is an empty table.
fn read_table(path: &Path) -> SpawnResult<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "table missing, treating as empty");
            Ok(String::new())
        }
        Err(e) => Err(e.into()),
    }
}

impl LeaseResolver {
    pub fn new(network: &NetworkConfig, daemon: Box<dyn DhcpDaemon>) -> Self {
        Self {
            lease_file: network.lease_file.clone(),
            reservation_file: network.reservation_file.clone(),
            prefix: network.prefix,
            max_offset: network.max_offset,
            poll_secs: network.lease_poll_secs.max(1),
            poll_sleep: Duration::from_secs(network.lease_poll_secs.max(1)),
            daemon,
            cancel: CancelToken::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the sleep between lease polls (the poll count still follows
    /// the configured interval).
    pub fn with_poll_sleep(mut self, sleep: Duration) -> Self {
        self.poll_sleep = sleep;
        self
    }

    pub fn prefix(&self) -> NetworkPrefix {
        self.prefix
    }

    /// First address free in both tables for a hostname prefix. Read-only.
    #[instrument(skip(self))]
    pub fn next_available_ip(&self, hostname_prefix: &str) -> SpawnResult<Ipv4Addr> {
        let leases = read_table(&self.lease_file)?;
        let reservations = read_table(&self.reservation_file)?;
        let ip = lease::select_free_address(
            hostname_prefix,
            self.prefix,
            self.max_offset,
            &[&leases, &reservations],
        )?;
        debug!(%ip, "free address");
        Ok(ip)
    }

    /// Append `mac,ip,name` to the reservation store, then reload the daemon once.
    #[instrument(skip(self), fields(hostname = %reservation.hostname))]
    pub fn write_reservation(&self, reservation: &LeaseReservation) -> SpawnResult<()> {
        if !self.prefix.contains(reservation.ip) {
            return Err(SpawnError::Config(format!(
                "{} is outside the guest network {}.0/24",
                reservation.ip, self.prefix
            )));
        }
        let existing = read_table(&self.reservation_file)?;
        // dnsmasq matches MACs and hostnames case-insensitively.
        let folded = existing.to_ascii_lowercase();
        let ip = reservation.ip.to_string();
        for token in [reservation.mac.as_str(), ip.as_str(), reservation.hostname.as_str()] {
            if lease::contains_token(&folded, &token.to_ascii_lowercase()) {
                return Err(SpawnError::Config(format!(
                    "'{}' is already present in {}",
                    token,
                    self.reservation_file.display()
                )));
            }
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.reservation_file)?;
        let mut record = String::new();
        if !existing.is_empty() && !existing.ends_with('\n') {
            record.push('\n');
        }
        record.push_str(&reservation.to_record());
        record.push('\n');
        file.write_all(record.as_bytes())?;
        file.sync_all()?;
        info!(record = %reservation.to_record(), "Reservation written");

        self.daemon.reload()
    }

    /// Current lease for an exact hostname, if any.
    pub fn find_lease(&self, hostname: &str) -> SpawnResult<Option<LeaseEntry>> {
        let leases = read_table(&self.lease_file)?;
        Ok(lease::find_lease(&leases, hostname))
    }

    /// Poll the lease table until `hostname` holds a lease.
    #[instrument(skip(self))]
    pub fn await_lease(&self, hostname: &str, timeout_secs: u64) -> SpawnResult<LeaseEntry> {
        let polls = timeout_secs / self.poll_secs + 1;
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        info!(timeout_secs, "Waiting for DHCP lease");

        for attempt in 1..=polls {
            if self.cancel.is_cancelled() {
                return Err(SpawnError::Cancelled {
                    label: hostname.to_string(),
                });
            }
            if let Some(entry) = self.find_lease(hostname)? {
                info!(ip = %entry.ip, attempt, "Lease confirmed");
                return Ok(entry);
            }
            if attempt == polls || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(self.poll_sleep);
        }
        Err(SpawnError::LeaseTimeout {
            hostname: hostname.to_string(),
            timeout_secs,
        })
    }
}
