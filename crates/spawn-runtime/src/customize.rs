//! First-boot customization of a cloned guest.
//!
//! The clone still carries the base image's hostname and bootstrap network
//! config. We rename it, then hand off to a detached one-shot script that
//! switches it to DHCP and seals it. A persisted marker makes the whole
//! step a no-op on guests that already went through it.

use std::io::Write;

use spawn_core::config::{CustomizeConfig, GuestProfile};
use spawn_core::naming::validate_guest_name;
use spawn_core::{SpawnError, SpawnResult};
use tracing::{info, instrument};

use crate::remote::{GuestTarget, RemoteChannel};
use crate::shell::shell_quote;

const LATER_TEMPLATE: &str = include_str!("../resources/later.sh.tera");

/// Delay inside the later script so the launching session can disconnect
/// before the network is torn down.
const LATER_SETTLE_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomizeOutcome {
    Applied,
    AlreadyBootstrapped,
}

/// Prints `yes` when the bootstrap marker exists, `no` otherwise.
pub fn marker_check_script(marker: &str) -> String {
    format!("test -f {} && echo yes || echo no", shell_quote(marker))
}

/// Rewrite `/etc/hosts` and `/etc/hostname` to `hostname`.
///
/// Whole-word substitution of the current name, so running it twice leaves
/// the files unchanged.
pub fn hostname_script(hostname: &str) -> SpawnResult<String> {
    validate_guest_name(hostname).map_err(|e| SpawnError::Config(format!("{:#}", e)))?;
    Ok(format!(
        r#"set -e
NEW={new}
OLD="$(cat /etc/hostname 2>/dev/null || hostname)"
if [ -n "$OLD" ] && [ "$OLD" != "$NEW" ]; then
    sed -i -E "s/(^|[[:space:]])$OLD([[:space:]]|$)/\1$NEW\2/g" /etc/hosts
fi
grep -qE "(^|[[:space:]])$NEW([[:space:]]|$)" /etc/hosts || echo "127.0.1.1 $NEW" >> /etc/hosts
echo "$NEW" > /etc/hostname
hostname "$NEW"
"#,
        new = hostname
    ))
}

/// Render the one-shot "later" script for a guest.
pub fn render_later_script(
    config: &CustomizeConfig,
    profile: &GuestProfile,
    hostname: &str,
) -> SpawnResult<String> {
    let template = match &config.later_template {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            SpawnError::Config(format!("later template {}: {}", path.display(), e))
        })?,
        None => LATER_TEMPLATE.to_string(),
    };

    let mut tera = tera::Tera::default();
    tera.add_raw_template("later.sh", &template)
        .map_err(|e| SpawnError::Config(format!("Failed to parse later template: {}", e)))?;

    let mut ctx = tera::Context::new();
    ctx.insert("hostname", hostname);
    ctx.insert("marker", &shell_quote(&config.marker));
    ctx.insert("network_file", &shell_quote(&profile.network_file));
    ctx.insert("network_reload", &config.network_reload);
    ctx.insert("bootstrap_unit", &shell_quote(&profile.bootstrap_unit));
    ctx.insert("settle_secs", &LATER_SETTLE_SECS);

    tera.render("later.sh", &ctx)
        .map_err(|e| SpawnError::Config(format!("Failed to render later template: {}", e)))
}

/// Applies first-boot customization over a [`RemoteChannel`].
pub struct Customizer<'a> {
    channel: &'a dyn RemoteChannel,
    config: &'a CustomizeConfig,
    profile: &'a GuestProfile,
}

impl<'a> Customizer<'a> {
    pub fn new(
        channel: &'a dyn RemoteChannel,
        config: &'a CustomizeConfig,
        profile: &'a GuestProfile,
    ) -> Self {
        Self {
            channel,
            config,
            profile,
        }
    }

    pub fn is_bootstrapped(&self, target: &GuestTarget) -> SpawnResult<bool> {
        let out = self
            .channel
            .run(target, &marker_check_script(&self.config.marker))?;
        Ok(out.trim() == "yes")
    }

    #[instrument(skip(self), fields(guest = %target.name))]
    pub fn customize(&self, target: &GuestTarget) -> SpawnResult<CustomizeOutcome> {
        if self.is_bootstrapped(target)? {
            info!("Bootstrap marker present, skipping customization");
            return Ok(CustomizeOutcome::AlreadyBootstrapped);
        }

        self.channel.run(target, &hostname_script(&target.name)?)?;

        let script = render_later_script(self.config, self.profile, &target.name)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("spawnctl-later-")
            .suffix(".sh")
            .tempfile()?;
        tmp.write_all(script.as_bytes())?;
        tmp.flush()?;
        self.channel
            .push_file(target, tmp.path(), &self.config.later_path)?;

        let path = shell_quote(&self.config.later_path);
        self.channel.run(
            target,
            &format!(
                "chmod 0755 {p} && nohup setsid {p} >/dev/null 2>&1 < /dev/null &",
                p = path
            ),
        )?;
        info!(later = %self.config.later_path, "Later script launched");
        Ok(CustomizeOutcome::Applied)
    }
}
