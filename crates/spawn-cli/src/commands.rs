use std::cell::Cell;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

use crate::logging::{self, LogFormat};
use crate::ui;

use spawn_core::config::SpawnConfig;
use spawn_core::guest::{GuestRole, GuestState, LeaseReservation};
use spawn_core::phase::SpawnStep;
use spawn_core::{SpawnError, SpawnFailure};
use spawn_runtime::backend::{GuestBackend, backend_for};
use spawn_runtime::base_image::{BaseImageEnsurer, BaseOutcome};
use spawn_runtime::network::{
    CancelToken, LeaseResolver, PingProbe, ReachabilityMonitor, SignalDaemon,
};
use spawn_runtime::remote::channel_for;
use spawn_runtime::{SpawnReport, SpawnRequest, Spawner, preflight};

#[derive(Parser)]
#[command(
    name = "spawnctl",
    version,
    about = "Spawn QEMU VMs and LXC containers from a provisioned base image"
)]
struct Cli {
    /// Config file (default: $SPAWNCTL_CONFIG, then /etc/spawnctl/spawnctl.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "human")]
    log_format: LogFormat,

    /// Debug-level logs from spawnctl crates
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, boot, and customize a new guest from the base image
    Spawn {
        /// Guest role: vm or ct
        role: GuestRole,
        /// Reserve a fixed address for the guest's MAC before it boots
        #[arg(long, conflicts_with = "no_reserve")]
        reserve: bool,
        /// Skip the reservation prompt and use a dynamic lease
        #[arg(long)]
        no_reserve: bool,
        /// Print the spawn report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or build the base image
    Base {
        #[command(subcommand)]
        action: BaseCmd,
    },
    /// List guests known to the backend
    List {
        /// Guest role: vm or ct
        role: GuestRole,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Address allocation and DHCP leases
    Ip {
        #[command(subcommand)]
        action: IpCmd,
    },
    /// Wait until an address answers consecutive pings
    Wait {
        ip: Ipv4Addr,
        /// Probe budget in seconds
        #[arg(long, short = 't', default_value = "60")]
        timeout: u64,
        /// Consecutive successful probes required
        #[arg(long, short = 's', default_value = "4")]
        successes: u32,
        /// Name used in messages (defaults to the address)
        #[arg(long)]
        label: Option<String>,
    },
    /// Show or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum BaseCmd {
    /// Build the base image if missing, or make sure it is stopped
    Ensure { role: GuestRole },
    /// Show base/pre-base state and manifest completeness
    Status { role: GuestRole },
}

#[derive(Subcommand)]
enum IpCmd {
    /// Print the next free address for a hostname prefix
    Next { prefix: String },
    /// Append a MAC/IP/name reservation and reload the DHCP daemon
    Reserve {
        mac: String,
        ip: Ipv4Addr,
        name: String,
    },
    /// Show the lease for a hostname, optionally waiting for it
    Lease {
        hostname: String,
        /// Wait up to this many seconds for the lease to appear
        #[arg(long, short = 't')]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the effective config as TOML
    Show,
    /// Write the default config
    Init {
        /// Destination (default: the resolved config path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Spawn {
            role,
            reserve,
            no_reserve,
            json,
        } => cmd_spawn(config_path, role, reserve, no_reserve, json),
        Commands::Base { action } => match action {
            BaseCmd::Ensure { role } => cmd_base_ensure(config_path, role),
            BaseCmd::Status { role } => cmd_base_status(config_path, role),
        },
        Commands::List { role, json } => cmd_list(config_path, role, json),
        Commands::Ip { action } => match action {
            IpCmd::Next { prefix } => cmd_ip_next(config_path, &prefix),
            IpCmd::Reserve { mac, ip, name } => cmd_ip_reserve(config_path, &mac, ip, &name),
            IpCmd::Lease { hostname, timeout } => cmd_ip_lease(config_path, &hostname, timeout),
        },
        Commands::Wait {
            ip,
            timeout,
            successes,
            label,
        } => cmd_wait(config_path, ip, timeout, successes, label.as_deref()),
        Commands::Config { action } => match action {
            ConfigCmd::Show => cmd_config_show(config_path),
            ConfigCmd::Init { path, force } => {
                cmd_config_init(path.as_deref().or(config_path), force)
            }
        },
        Commands::Completions { shell } => cmd_completions(shell),
    }
}

/// Process exit code for an error returned by [`run`].
///
/// 2 and 3 mark bounded waits that ran out (the guest may still come up),
/// 130 an operator abort, 1 everything else.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(failure) = cause.downcast_ref::<SpawnFailure>() {
            return code_for(&failure.source);
        }
        if let Some(e) = cause.downcast_ref::<SpawnError>() {
            return code_for(e);
        }
    }
    1
}

fn code_for(err: &SpawnError) -> u8 {
    match err {
        SpawnError::Timeout { .. } => 2,
        SpawnError::LeaseTimeout { .. } => 3,
        SpawnError::Cancelled { .. } => 130,
        _ => 1,
    }
}

/// `--reserve` / `--no-reserve` win; otherwise ask only on a terminal.
fn resolve_reserve(
    reserve: bool,
    no_reserve: bool,
    interactive: bool,
    ask: impl FnOnce() -> bool,
) -> bool {
    if reserve {
        true
    } else if no_reserve || !interactive {
        false
    } else {
        ask()
    }
}

fn load_config(path: Option<&Path>) -> Result<SpawnConfig> {
    SpawnConfig::load(path)
}

/// Ctrl-C flips the token; polls notice it at the next tick.
fn install_cancel_handler() -> CancelToken {
    let token = CancelToken::new();
    let handler = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.cancel()) {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }
    token
}

fn resolver(config: &SpawnConfig) -> LeaseResolver {
    LeaseResolver::new(
        &config.network,
        Box::new(SignalDaemon::new(&config.network.daemon)),
    )
}

fn step_message(step: SpawnStep) -> &'static str {
    match step {
        SpawnStep::Preflight => "Checking host tools",
        SpawnStep::EnsureBase => "Ensuring base image",
        SpawnStep::GenerateName => "Picking a guest name",
        SpawnStep::Clone => "Cloning base image",
        SpawnStep::ReadMac => "Reading generated MAC address",
        SpawnStep::Reserve => "Reserving a fixed address",
        SpawnStep::Start => "Starting guest",
        SpawnStep::AwaitNetwork => "Waiting for the bootstrap network",
        SpawnStep::Customize => "Customizing guest",
        SpawnStep::ConfirmLease => "Waiting for the DHCP lease",
    }
}

// ============================================================================
// Spawn
// ============================================================================

fn cmd_spawn(
    config_path: Option<&Path>,
    role: GuestRole,
    reserve: bool,
    no_reserve: bool,
    json: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let reserve = resolve_reserve(reserve, no_reserve, ui::is_interactive(), || {
        ui::confirm("Reserve a fixed IP address for the new guest?", false)
    });

    let cancel = install_cancel_handler();
    let backend = backend_for(role, &config);
    let channel = channel_for(role, &config);
    let probe = PingProbe;
    let monitor =
        ReachabilityMonitor::from_config(&probe, &config.network).with_cancel(cancel.clone());
    let resolver = resolver(&config).with_cancel(cancel);

    let total = if reserve { 10 } else { 9 };
    let done = Cell::new(0usize);
    let observer = |step: SpawnStep| {
        done.set(done.get() + 1);
        if !json {
            ui::step(done.get(), total, step_message(step));
        }
    };

    let spawner = Spawner::new(&config, backend.as_ref(), channel.as_ref(), &monitor, &resolver)
        .with_preflight()
        .with_observer(&observer);

    match spawner.spawn(SpawnRequest { role, reserve }) {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(notice) = failure_notice(&failure, json) {
                ui::warn(&notice);
            }
            Err(failure.into())
        }
    }
}

/// Human note about a guest a failed spawn left behind; none in JSON mode.
fn failure_notice(failure: &SpawnFailure, json: bool) -> Option<String> {
    if json {
        return None;
    }
    failure.guest.as_ref().map(|guest| {
        format!(
            "Guest '{}' left in place (reached {}) for inspection",
            guest, failure.phase
        )
    })
}

fn print_report(report: &SpawnReport) {
    ui::success(&format!("Guest '{}' is up", report.guest.name));
    ui::status_line("Role:", &report.guest.role.to_string());
    ui::status_line("Address:", &report.leased_ip.to_string());
    if let Some(mac) = &report.guest.mac {
        ui::status_line("MAC:", mac);
    }
    let reservation = match &report.reservation {
        Some(r) => format!("fixed {}", r.ip),
        None => "dynamic".to_string(),
    };
    ui::status_line("Lease:", &reservation);
    ui::status_line(
        "Base image:",
        if report.base_built { "built" } else { "reused" },
    );
    let elapsed = report.finished_at - report.started_at;
    ui::status_line("Elapsed:", &format!("{}s", elapsed.num_seconds()));
}

// ============================================================================
// Base image
// ============================================================================

fn cmd_base_ensure(config_path: Option<&Path>, role: GuestRole) -> Result<()> {
    let config = load_config(config_path)?;
    preflight::check(role, &config)?;

    let cancel = install_cancel_handler();
    let backend = backend_for(role, &config);
    let channel = channel_for(role, &config);
    let probe = PingProbe;
    let monitor = ReachabilityMonitor::from_config(&probe, &config.network).with_cancel(cancel);

    let profile = config.profile(role);
    ui::info(&format!("Ensuring base image '{}'", profile.base_name));
    let outcome =
        BaseImageEnsurer::new(role, &config, backend.as_ref(), channel.as_ref(), &monitor)
            .ensure()?;
    match outcome {
        BaseOutcome::Reused => ui::success(&format!("Base '{}' ready (reused)", profile.base_name)),
        BaseOutcome::Built => ui::success(&format!("Base '{}' built", profile.base_name)),
    }
    Ok(())
}

fn cmd_base_status(config_path: Option<&Path>, role: GuestRole) -> Result<()> {
    let config = load_config(config_path)?;
    let backend = backend_for(role, &config);
    let channel = channel_for(role, &config);
    let probe = PingProbe;
    let monitor = ReachabilityMonitor::from_config(&probe, &config.network);

    let status =
        BaseImageEnsurer::new(role, &config, backend.as_ref(), channel.as_ref(), &monitor)
            .status()?;

    ui::status_header(&format!("{} base image ({})", role, backend.kind()));
    ui::status_line(&format!("{}:", status.pre_base_name), &status.pre_base.to_string());
    ui::status_line(&format!("{}:", status.base_name), &status.base.to_string());
    if status.missing_files.is_empty() {
        ui::status_line("Manifest:", "complete");
    } else {
        ui::status_line(
            "Manifest:",
            &format!("missing {} file(s)", status.missing_files.len()),
        );
        for path in &status.missing_files {
            ui::status_line("", &format!("missing {}", path.display()));
        }
    }
    Ok(())
}

// ============================================================================
// List
// ============================================================================

#[derive(Serialize)]
struct GuestRow {
    name: String,
    state: GuestState,
}

fn cmd_list(config_path: Option<&Path>, role: GuestRole, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let backend = backend_for(role, &config);
    let rows = list_rows(backend.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        ui::info(&format!("No {} guests defined.", role));
        return Ok(());
    }
    for row in &rows {
        ui::status_line(&format!("  - {}", row.name), &row.state.to_string());
    }
    Ok(())
}

fn list_rows(backend: &dyn GuestBackend) -> Result<Vec<GuestRow>> {
    let mut rows = Vec::new();
    for name in backend.list()? {
        let state = GuestState::from_flags(true, backend.is_running(&name)?);
        rows.push(GuestRow { name, state });
    }
    Ok(rows)
}

// ============================================================================
// Addresses and leases
// ============================================================================

fn cmd_ip_next(config_path: Option<&Path>, prefix: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let ip = resolver(&config).next_available_ip(prefix)?;
    println!("{}", ip);
    Ok(())
}

fn cmd_ip_reserve(config_path: Option<&Path>, mac: &str, ip: Ipv4Addr, name: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let reservation = LeaseReservation::new(mac, ip, name)?;
    resolver(&config).write_reservation(&reservation)?;
    ui::success(&format!("Reserved {}", reservation.to_record()));
    Ok(())
}

fn cmd_ip_lease(config_path: Option<&Path>, hostname: &str, timeout: Option<u64>) -> Result<()> {
    let config = load_config(config_path)?;
    let resolver = resolver(&config);

    let entry = match timeout {
        None => resolver
            .find_lease(hostname)?
            .with_context(|| format!("No DHCP lease for '{}'", hostname))?,
        Some(secs) => {
            let cancel = install_cancel_handler();
            let resolver = resolver.with_cancel(cancel);
            let pb = ui::spinner(&format!("Waiting for a lease for '{}'", hostname));
            let result = resolver.await_lease(hostname, secs);
            pb.finish_and_clear();
            result?
        }
    };
    println!("{} {} {}", entry.ip, entry.mac, entry.hostname);
    Ok(())
}

// ============================================================================
// Wait
// ============================================================================

fn cmd_wait(
    config_path: Option<&Path>,
    ip: Ipv4Addr,
    timeout: u64,
    successes: u32,
    label: Option<&str>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let cancel = install_cancel_handler();
    let probe = PingProbe;
    let monitor = ReachabilityMonitor::from_config(&probe, &config.network).with_cancel(cancel);

    let label = label.map(str::to_string).unwrap_or_else(|| ip.to_string());
    let pb = ui::spinner(&format!("Waiting for {} ({} consecutive replies)", label, successes));
    let result = monitor.await_reachable(ip, timeout, successes, &label);
    pb.finish_and_clear();
    let attempts = result?;
    ui::success(&format!("{} reachable after {} probes", label, attempts));
    Ok(())
}

// ============================================================================
// Config
// ============================================================================

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let (path, _) = SpawnConfig::resolve_path(config_path);
    let config = load_config(config_path)?;
    if path.exists() {
        println!("# source: {}", path.display());
    } else {
        println!("# source: built-in defaults ({} not found)", path.display());
    }
    print!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let (target, _) = SpawnConfig::resolve_path(path);
    if target.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            target.display()
        );
    }
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(&target, SpawnConfig::default().to_toml()?)
        .with_context(|| format!("Failed to write {}", target.display()))?;
    ui::success(&format!("Wrote default config to {}", target.display()));
    Ok(())
}

fn cmd_completions(shell: clap_complete::Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "spawnctl", &mut std::io::stdout());
    Ok(())
}
