use std::process::ExitCode;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    match spawn_cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            spawn_cli::ui::error(&format!("{:#}", e));
            ExitCode::from(spawn_cli::exit_code(&e))
        }
    }
}
