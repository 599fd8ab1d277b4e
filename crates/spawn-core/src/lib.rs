// spawn-core: Pure types, config, naming, address policy
// No internal spawnctl dependencies; this is the foundation crate.

pub mod config;
pub mod error;
pub mod guest;
pub mod lease;
pub mod manifest;
pub mod naming;
pub mod phase;

pub use error::{SpawnError, SpawnFailure, SpawnResult};
