//! Guest network plumbing: reachability probing, DHCP daemon control, and
//! lease/reservation bookkeeping.

pub mod daemon;
pub mod reachability;
pub mod resolver;

pub use daemon::{DhcpDaemon, SignalDaemon};
pub use reachability::{CancelToken, PingProbe, Probe, ProbeStreak, ReachabilityMonitor};
pub use resolver::LeaseResolver;
