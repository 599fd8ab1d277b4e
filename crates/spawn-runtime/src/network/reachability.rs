use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use spawn_core::config::NetworkConfig;
use spawn_core::{SpawnError, SpawnResult};
use tracing::{debug, info, instrument, warn};

use crate::shell::run_host_ok;

/// One bounded reachability check against an address.
pub trait Probe {
    fn probe(&self, target: Ipv4Addr) -> bool;
}

/// Single ICMP echo with a one second reply deadline.
pub struct PingProbe;

impl Probe for PingProbe {
    fn probe(&self, target: Ipv4Addr) -> bool {
        let ip = target.to_string();
        match run_host_ok("ping", &["-c", "1", "-W", "1", &ip]) {
            Ok(ok) => ok,
            Err(e) => {
                warn!(target = %ip, "ping could not run: {:#}", e);
                false
            }
        }
    }
}

/// Shared abort flag, checked between probe ticks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consecutive-success counter for one polling session.
#[derive(Debug, Clone, Default)]
pub struct ProbeStreak {
    current: u32,
    best: u32,
    attempts: u64,
}

impl ProbeStreak {
    /// Record one probe result and return the streak after it.
    pub fn observe(&mut self, ok: bool) -> u32 {
        self.attempts += 1;
        if ok {
            self.current += 1;
            self.best = self.best.max(self.current);
        } else {
            self.current = 0;
        }
        self.current
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn best(&self) -> u32 {
        self.best
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

/// Polls a [`Probe`] until enough consecutive successes or the budget runs out.
///
/// The budget is `timeout_secs + grace_secs` ticks, also enforced as a
/// wall-clock deadline so slow probes cannot stretch it.
pub struct ReachabilityMonitor<'a> {
    probe: &'a dyn Probe,
    interval: Duration,
    grace_secs: u64,
    cancel: CancelToken,
}

impl<'a> ReachabilityMonitor<'a> {
    pub fn new(probe: &'a dyn Probe, interval: Duration, grace_secs: u64) -> Self {
        Self {
            probe,
            interval,
            grace_secs,
            cancel: CancelToken::default(),
        }
    }

    pub fn from_config(probe: &'a dyn Probe, network: &NetworkConfig) -> Self {
        Self::new(
            probe,
            Duration::from_millis(network.probe_interval_ms),
            network.grace_secs,
        )
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Block until `target` answered `required` probes in a row.
    ///
    /// Returns the number of probes sent.
    #[instrument(skip(self), fields(%target))]
    pub fn await_reachable(
        &self,
        target: Ipv4Addr,
        timeout_secs: u64,
        required: u32,
        label: &str,
    ) -> SpawnResult<u64> {
        if required == 0 {
            return Err(SpawnError::Config(
                "required consecutive successes must be at least 1".to_string(),
            ));
        }
        if timeout_secs < u64::from(required) {
            return Err(SpawnError::Config(format!(
                "timeout of {}s cannot fit {} consecutive one-second probes",
                timeout_secs, required
            )));
        }

        let budget = timeout_secs + self.grace_secs;
        let deadline = Instant::now() + Duration::from_secs(budget);
        let mut streak = ProbeStreak::default();
        info!(label, timeout_secs, required, "Waiting for network");

        loop {
            if self.cancel.is_cancelled() {
                return Err(SpawnError::Cancelled {
                    label: label.to_string(),
                });
            }

            let tick_start = Instant::now();
            let ok = self.probe.probe(target);
            let current = streak.observe(ok);
            debug!(attempt = streak.attempts(), ok, streak = current, "probe");

            if current >= required {
                info!(label, attempts = streak.attempts(), "Reachable");
                return Ok(streak.attempts());
            }

            // Ticks run from their start. Stop when one more tick at the last
            // probe latency would end past the deadline.
            let now = Instant::now();
            let probe_time = now - tick_start;
            let wait = self.interval.saturating_sub(probe_time);
            let remaining = deadline.saturating_duration_since(now);
            if streak.attempts() >= budget || wait + probe_time > remaining {
                return Err(SpawnError::Timeout {
                    label: label.to_string(),
                    target,
                    timeout_secs,
                    attempts: streak.attempts(),
                    best_streak: streak.best(),
                });
            }
            std::thread::sleep(wait);
        }
    }

    /// Single probe, used to check that an address is still unclaimed.
    pub fn is_answering(&self, target: Ipv4Addr) -> bool {
        self.probe.probe(target)
    }
}
