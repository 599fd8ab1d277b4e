//! # spawnctl: golden-image guest spawner
//!
//! Facade crate that re-exports the spawnctl workspace crates so consumers
//! can depend on a single `spawnctl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | spawn-core | Config, errors, phases, naming, address policy |
//! | [`runtime`] | spawn-runtime | Backends, reachability, leases, base image, spawner |
//! | [`cli`] | spawn-cli | Clap commands, UI, logging |

pub use spawn_cli as cli;
pub use spawn_core as core;
pub use spawn_runtime as runtime;
