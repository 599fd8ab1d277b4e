//! The spawn state machine: base image to a customized guest holding a lease.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use spawn_core::config::SpawnConfig;
use spawn_core::guest::{GuestRole, GuestSpec, GuestState, LeaseReservation};
use spawn_core::naming::generate_unique_name;
use spawn_core::phase::{SpawnPhase, SpawnStep, validate_transition};
use spawn_core::{SpawnError, SpawnFailure, SpawnResult};
use tracing::{info, instrument, warn};

use crate::backend::{AddressKind, GuestBackend};
use crate::base_image::{BaseImageEnsurer, BaseOutcome, ensure_address_free};
use crate::customize::{CustomizeOutcome, Customizer};
use crate::network::{LeaseResolver, ReachabilityMonitor};
use crate::preflight;
use crate::remote::{GuestTarget, RemoteChannel};

/// Tries at finding an unused generated name before giving up.
pub const NAME_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRequest {
    pub role: GuestRole,
    /// Pin the guest's MAC to the next free address before it boots.
    pub reserve: bool,
}

/// Outcome of a completed spawn.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnReport {
    pub guest: GuestSpec,
    pub base_built: bool,
    pub customized: bool,
    pub phases: Vec<SpawnPhase>,
    pub reservation: Option<LeaseReservation>,
    pub leased_ip: Ipv4Addr,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Phase bookkeeping for one spawn run.
struct Progress {
    phase: SpawnPhase,
    phases: Vec<SpawnPhase>,
    guest: Option<String>,
}

impl Progress {
    fn new() -> Self {
        Self {
            phase: SpawnPhase::Init,
            phases: vec![SpawnPhase::Init],
            guest: None,
        }
    }

    fn failure(&self, step: SpawnStep, source: SpawnError) -> SpawnFailure {
        SpawnFailure {
            step,
            phase: self.phase,
            guest: self.guest.clone(),
            source,
        }
    }

    fn advance(&mut self, step: SpawnStep, to: SpawnPhase) -> Result<(), SpawnFailure> {
        validate_transition(self.phase, to)
            .map_err(|e| self.failure(step, SpawnError::Config(format!("{:#}", e))))?;
        info!(from = %self.phase, to = %to, "phase");
        self.phase = to;
        self.phases.push(to);
        Ok(())
    }
}

type StepObserver<'a> = &'a dyn Fn(SpawnStep);

pub struct Spawner<'a> {
    config: &'a SpawnConfig,
    backend: &'a dyn GuestBackend,
    channel: &'a dyn RemoteChannel,
    monitor: &'a ReachabilityMonitor<'a>,
    resolver: &'a LeaseResolver,
    preflight: bool,
    observer: Option<StepObserver<'a>>,
}

impl<'a> Spawner<'a> {
    pub fn new(
        config: &'a SpawnConfig,
        backend: &'a dyn GuestBackend,
        channel: &'a dyn RemoteChannel,
        monitor: &'a ReachabilityMonitor<'a>,
        resolver: &'a LeaseResolver,
    ) -> Self {
        Self {
            config,
            backend,
            channel,
            monitor,
            resolver,
            preflight: false,
            observer: None,
        }
    }

    /// Check host tools on `PATH` before touching anything.
    pub fn with_preflight(mut self) -> Self {
        self.preflight = true;
        self
    }

    /// Called at the start of every step.
    pub fn with_observer(mut self, observer: StepObserver<'a>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn spawn(&self, request: SpawnRequest) -> Result<SpawnReport, SpawnFailure> {
        self.spawn_with_rng(request, &mut rand::thread_rng())
    }

    /// Run one spawn to completion or to the first failing step.
    ///
    /// Nothing is rolled back on failure: a cloned or running guest stays
    /// in place and is named in the returned [`SpawnFailure`].
    #[instrument(skip(self, rng), fields(role = %request.role, reserve = request.reserve))]
    pub fn spawn_with_rng<R: Rng + ?Sized>(
        &self,
        request: SpawnRequest,
        rng: &mut R,
    ) -> Result<SpawnReport, SpawnFailure> {
        let started_at = Utc::now();
        let role = request.role;
        let profile = self.config.profile(role);
        let net = &self.config.network;
        let mut run = Progress::new();

        if self.preflight {
            self.step(&run, SpawnStep::Preflight, || preflight::check(role, self.config))?;
        }

        let base = self.step(&run, SpawnStep::EnsureBase, || {
            BaseImageEnsurer::new(role, self.config, self.backend, self.channel, self.monitor)
                .ensure()
        })?;
        run.advance(SpawnStep::EnsureBase, SpawnPhase::BaseReady)?;

        let name = self.step(&run, SpawnStep::GenerateName, || {
            let existing = self.backend.list()?;
            generate_unique_name(role, &existing, NAME_ATTEMPTS, rng)
                .map_err(|e| SpawnError::Config(format!("{:#}", e)))
        })?;
        run.guest = Some(name.clone());
        let mut guest = GuestSpec::new(&name, role);
        info!(guest = %name, "Generated guest name");

        self.step(&run, SpawnStep::Clone, || {
            self.backend.clone_guest(&profile.base_name, &name)
        })?;
        guest.state = GuestState::Stopped;
        run.advance(SpawnStep::Clone, SpawnPhase::Cloned)?;

        let mac = self.step(&run, SpawnStep::ReadMac, || {
            self.backend.read_generated_address(&name, AddressKind::Mac)
        })?;
        guest.mac = Some(mac.clone());

        let reservation = if request.reserve {
            let reservation = self.step(&run, SpawnStep::Reserve, || self.reserve(&mac, &name))?;
            guest.ip = Some(reservation.ip);
            Some(reservation)
        } else {
            None
        };

        self.step(&run, SpawnStep::Start, || {
            ensure_address_free(self.monitor, profile.bootstrap_ip)?;
            self.backend.start(&name)
        })?;
        guest.state = GuestState::Running;
        run.advance(SpawnStep::Start, SpawnPhase::Started)?;

        self.step(&run, SpawnStep::AwaitNetwork, || {
            self.monitor.await_reachable(
                profile.bootstrap_ip,
                net.reachability_timeout_secs,
                net.required_successes,
                &name,
            )
        })?;
        run.advance(SpawnStep::AwaitNetwork, SpawnPhase::NetworkUp)?;

        let customized = self.step(&run, SpawnStep::Customize, || {
            Customizer::new(self.channel, &self.config.customize, profile)
                .customize(&GuestTarget::new(&name, profile.bootstrap_ip))
        })?;
        run.advance(SpawnStep::Customize, SpawnPhase::Customized)?;
        let addressing = if reservation.is_some() {
            SpawnPhase::IpFixed
        } else {
            SpawnPhase::DynamicIp
        };
        run.advance(SpawnStep::Customize, addressing)?;

        let lease = self.step(&run, SpawnStep::ConfirmLease, || {
            self.resolver.await_lease(&name, net.lease_timeout_secs)
        })?;
        if let Some(r) = &reservation
            && r.ip != lease.ip
        {
            warn!(reserved = %r.ip, leased = %lease.ip, "Lease differs from reservation");
        }
        guest.ip = Some(lease.ip);
        run.advance(SpawnStep::ConfirmLease, SpawnPhase::LeaseConfirmed)?;
        run.advance(SpawnStep::ConfirmLease, SpawnPhase::Done)?;

        info!(guest = %name, ip = %lease.ip, "Spawn complete");
        Ok(SpawnReport {
            guest,
            base_built: base == BaseOutcome::Built,
            customized: customized == CustomizeOutcome::Applied,
            phases: run.phases,
            reservation,
            leased_ip: lease.ip,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn reserve(&self, mac: &str, name: &str) -> SpawnResult<LeaseReservation> {
        let ip = self.resolver.next_available_ip(name)?;
        let reservation = LeaseReservation::new(mac, ip, name)
            .map_err(|e| SpawnError::Config(format!("{:#}", e)))?;
        self.resolver.write_reservation(&reservation)?;
        info!(%ip, mac, "Reserved address");
        Ok(reservation)
    }

    fn step<T>(
        &self,
        run: &Progress,
        step: SpawnStep,
        f: impl FnOnce() -> SpawnResult<T>,
    ) -> Result<T, SpawnFailure> {
        if let Some(observer) = self.observer {
            observer(step);
        }
        f().map_err(|e| {
            warn!(%step, phase = %run.phase, "Step failed: {}", e);
            run.failure(step, e)
        })
    }
}
