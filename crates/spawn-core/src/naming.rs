use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use rand::Rng;
use regex::Regex;

use crate::guest::GuestRole;

static GUEST_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").expect("valid regex"));

static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$").expect("valid regex")
});

/// Digits in a generated name suffix.
pub const NAME_SUFFIX_DIGITS: usize = 6;

/// Validate a guest name before it reaches a backend command line.
pub fn validate_guest_name(name: &str) -> Result<()> {
    if name.len() > 63 {
        bail!("Guest name must be at most 63 characters, got {}", name.len());
    }
    if !GUEST_NAME_RE.is_match(name) {
        bail!(
            "Invalid guest name {:?}: use letters, digits, '-' and '_' (must start alphanumeric)",
            name
        );
    }
    Ok(())
}

/// Generate a candidate guest name: role prefix + 6 random digits.
pub fn generate_guest_name<R: Rng + ?Sized>(role: GuestRole, rng: &mut R) -> String {
    let n: u32 = rng.gen_range(0..1_000_000);
    format!("{}{:0width$}", role.prefix(), n, width = NAME_SUFFIX_DIGITS)
}

/// Generate a name not present in `existing`, giving up after `attempts`.
pub fn generate_unique_name<R: Rng + ?Sized>(
    role: GuestRole,
    existing: &BTreeSet<String>,
    attempts: u32,
    rng: &mut R,
) -> Result<String> {
    for _ in 0..attempts {
        let candidate = generate_guest_name(role, rng);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }
    bail!(
        "Could not generate a unique {} name after {} attempts",
        role,
        attempts
    )
}

/// Check MAC syntax (`:` or `-` separated hex pairs).
pub fn is_valid_mac(mac: &str) -> bool {
    MAC_RE.is_match(mac)
}

/// Lowercase, colon-separated form of a MAC address.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let mac = mac.trim();
    if !is_valid_mac(mac) {
        bail!("Invalid MAC address format: {:?}", mac);
    }
    Ok(mac.replace('-', ":").to_ascii_lowercase())
}
