use anyhow::{Context, Result};
use std::process::{Command, Output, Stdio};

use tracing::debug;

/// Render a command line for logs and error messages.
pub fn command_line(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    }
}

/// Single-quote a string for POSIX `sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Run a command on the host, capturing output.
pub fn run_host(cmd: &str, args: &[&str]) -> Result<Output> {
    let line = command_line(cmd, args);
    debug!(command = %line, "exec");

    #[cfg(test)]
    if let Some(output) = super::shell_mock::intercept(&line) {
        return Ok(output);
    }

    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to run: {}", line))
}

/// Run a command on the host, failing on non-zero exit and returning stdout.
pub fn run_host_stdout(cmd: &str, args: &[&str]) -> Result<String> {
    let line = command_line(cmd, args);
    let output = run_host(cmd, args)?;
    check_status(&line, &output)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a command and only report whether it exited zero.
pub fn run_host_ok(cmd: &str, args: &[&str]) -> Result<bool> {
    Ok(run_host(cmd, args)?.status.success())
}

fn check_status(line: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!(
            "Command failed (exit {}): {}",
            output.status.code().unwrap_or(-1),
            line
        );
    }
    anyhow::bail!(
        "Command failed (exit {}): {}: {}",
        output.status.code().unwrap_or(-1),
        line,
        stderr
    )
}
