use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Spawn lifecycle phase. `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPhase {
    Init,
    BaseReady,
    Cloned,
    Started,
    NetworkUp,
    Customized,
    IpFixed,
    DynamicIp,
    LeaseConfirmed,
    Done,
    Failed,
}

impl std::fmt::Display for SpawnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::BaseReady => write!(f, "base-ready"),
            Self::Cloned => write!(f, "cloned"),
            Self::Started => write!(f, "started"),
            Self::NetworkUp => write!(f, "network-up"),
            Self::Customized => write!(f, "customized"),
            Self::IpFixed => write!(f, "ip-fixed"),
            Self::DynamicIp => write!(f, "dynamic-ip"),
            Self::LeaseConfirmed => write!(f, "lease-confirmed"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The unit of work the spawner was executing when something failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpawnStep {
    Preflight,
    EnsureBase,
    GenerateName,
    Clone,
    ReadMac,
    Reserve,
    Start,
    AwaitNetwork,
    Customize,
    ConfirmLease,
}

impl std::fmt::Display for SpawnStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Preflight => "preflight",
            Self::EnsureBase => "ensure-base",
            Self::GenerateName => "generate-name",
            Self::Clone => "clone",
            Self::ReadMac => "read-mac",
            Self::Reserve => "reserve",
            Self::Start => "start",
            Self::AwaitNetwork => "await-network",
            Self::Customize => "customize",
            Self::ConfirmLease => "confirm-lease",
        };
        f.write_str(s)
    }
}

/// Validate that a phase transition is allowed.
pub fn validate_transition(from: SpawnPhase, to: SpawnPhase) -> Result<()> {
    if from == SpawnPhase::Failed {
        bail!("Spawn already failed, cannot move to {}", to);
    }
    if to == SpawnPhase::Failed {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (SpawnPhase::Init, SpawnPhase::BaseReady)
            | (SpawnPhase::BaseReady, SpawnPhase::Cloned)
            | (SpawnPhase::Cloned, SpawnPhase::Started)
            | (SpawnPhase::Started, SpawnPhase::NetworkUp)
            | (SpawnPhase::NetworkUp, SpawnPhase::Customized)
            | (SpawnPhase::Customized, SpawnPhase::IpFixed)
            | (SpawnPhase::Customized, SpawnPhase::DynamicIp)
            | (SpawnPhase::IpFixed, SpawnPhase::LeaseConfirmed)
            | (SpawnPhase::DynamicIp, SpawnPhase::LeaseConfirmed)
            | (SpawnPhase::LeaseConfirmed, SpawnPhase::Done)
    );

    if valid {
        Ok(())
    } else {
        bail!("Invalid spawn transition: {} -> {}", from, to)
    }
}
