use spawn_core::config::SpawnConfig;
use spawn_core::guest::GuestRole;
use spawn_core::{SpawnError, SpawnResult};
use tracing::debug;

const LXC_TOOLS: &[&str] = &[
    "lxc-ls",
    "lxc-copy",
    "lxc-start",
    "lxc-stop",
    "lxc-info",
    "lxc-attach",
];

/// Host tools a spawn of `role` shells out to.
pub fn required_tools(role: GuestRole, config: &SpawnConfig) -> Vec<String> {
    let mut tools = vec!["ping".to_string(), "pkill".to_string()];
    match role {
        GuestRole::Vm => {
            tools.push(config.backends.vm_manager.command.clone());
            tools.push("ssh".to_string());
            tools.push("scp".to_string());
        }
        GuestRole::Ct => tools.extend(LXC_TOOLS.iter().map(|t| t.to_string())),
    }
    tools
}

/// Tools from `tools` that cannot be resolved on `PATH`.
pub fn missing_tools(tools: &[String]) -> Vec<String> {
    tools
        .iter()
        .filter(|t| which::which(t.as_str()).is_err())
        .cloned()
        .collect()
}

/// Fail with a config error naming every missing tool.
pub fn check(role: GuestRole, config: &SpawnConfig) -> SpawnResult<()> {
    let tools = required_tools(role, config);
    let missing = missing_tools(&tools);
    if !missing.is_empty() {
        return Err(SpawnError::Config(format!(
            "required host tools not found on PATH: {}",
            missing.join(", ")
        )));
    }
    debug!(?tools, "preflight ok");
    Ok(())
}
