// spawn-runtime: everything that touches the host, the guests, or the
// network, plus the spawn orchestration built on top.

pub mod backend;
pub mod base_image;
pub mod customize;
pub mod network;
pub mod preflight;
pub mod remote;
pub mod shell;
#[cfg(test)]
pub mod shell_mock;
pub mod spawner;

#[cfg(test)]
pub(crate) mod testing;

pub use spawner::{SpawnReport, SpawnRequest, Spawner};
