use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;

// ---------------------------------------------------------------------------
// Colored message helpers
// ---------------------------------------------------------------------------

fn prefix() -> String {
    "[spawnctl]".bold().cyan().to_string()
}

/// Print an informational message: [spawnctl] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message to stderr in red.
pub fn error(msg: &str) {
    eprintln!("{} {}", "[spawnctl]".bold().red(), msg.red());
}

/// Print a warning to stderr so `--json` output stays parseable.
pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}

/// Print a spawn step: [spawnctl] Step n/total: message
pub fn step(n: usize, total: usize, msg: &str) {
    println!(
        "{} {} {}",
        prefix(),
        format!("Step {}/{}:", n, total).bold().yellow(),
        msg,
    );
}

// ---------------------------------------------------------------------------
// Status table
// ---------------------------------------------------------------------------

pub fn status_header(title: &str) {
    println!("{}", title.bold());
    println!("{}", "-".repeat(title.len()).dimmed());
}

/// Print a status line with a bold label and a colored value.
pub fn status_line(label: &str, value: &str) {
    let colored_value = if value.starts_with("running") {
        value.green().to_string()
    } else if value.starts_with("stopped") {
        value.yellow().to_string()
    } else if value.starts_with("absent") || value.starts_with("missing") || value == "-" {
        value.dimmed().to_string()
    } else {
        value.to_string()
    };

    println!("{} {}", format!("{:<16}", label).bold(), colored_value);
}

// ---------------------------------------------------------------------------
// Interactive prompts
// ---------------------------------------------------------------------------

/// Whether stdin is attached to a terminal.
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal()
}

/// Show an interactive yes/no prompt. Returns `default` if the prompt fails.
pub fn confirm(msg: &str, default: bool) -> bool {
    inquire::Confirm::new(msg)
        .with_default(default)
        .prompt()
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Spinners
// ---------------------------------------------------------------------------

/// Create and start a spinner with the given message.
/// Call `.finish_with_message()` or `.finish_and_clear()` when done.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg} ({elapsed})")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
