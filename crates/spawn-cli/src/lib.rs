// spawn-cli: Clap commands, UI, logging setup
// Depends on spawn-core and spawn-runtime

pub mod commands;
pub mod logging;
pub mod ui;

pub use commands::{exit_code, run};
