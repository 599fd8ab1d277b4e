use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable compact output.
    Human,
    /// Structured JSON, one event per line.
    Json,
}

const DEFAULT_FILTER: &str = "spawnctl=info,spawn_core=info,spawn_runtime=info,spawn_cli=info,warn";
const VERBOSE_FILTER: &str =
    "spawnctl=debug,spawn_core=debug,spawn_runtime=debug,spawn_cli=debug,warn";

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER }
}

/// Initialize the global tracing subscriber. Logs go to stderr so command
/// output on stdout stays machine-readable.
///
/// Call once at program startup. `RUST_LOG` overrides the default filter.
pub fn init(format: LogFormat, verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    match format {
        LogFormat::Human => {
            let subscriber = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
        LogFormat::Json => {
            let subscriber = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(subscriber)
                .init();
        }
    }
}
