//! Boot orchestration policy: the provisioning gate decision and the
//! terminal halt state. The ordered lifecycle itself lives in the firmware
//! runtimes; this module owns the decisions those runtimes act on.

use std::fmt;

use crate::config::{force_config_flag, NetworkCredentials, ServerConfig};
use crate::error::HalError;
use crate::store::Store;

/// Interval between halt-state log lines.
pub const HALT_LOG_INTERVAL_MS: u64 = 5_000;

/// Why the orchestrator diverted into the captive portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionReason {
    ForceFlagSet,
    NotConfigured,
    EmptySsid,
    NoServerAddress,
}

impl ProvisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForceFlagSet => "force_config flag set",
            Self::NotConfigured => "device not configured",
            Self::EmptySsid => "stored ssid is empty",
            Self::NoServerAddress => "no server address stored",
        }
    }
}

/// Outcome of the provisioning gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootDecision {
    /// Block in the captive portal; exit only via reboot.
    Provision(ProvisionReason),
    /// Proceed to station bring-up with these settings.
    Continue {
        credentials: NetworkCredentials,
        server: ServerConfig,
    },
}

/// Evaluates steps 2 and 3 of the boot sequence against the store. The
/// force flag wins unconditionally; a station connection is never opened
/// when this returns `Provision`.
pub fn provisioning_gate(store: &dyn Store) -> Result<BootDecision, HalError> {
    if force_config_flag(store)? {
        return Ok(BootDecision::Provision(ProvisionReason::ForceFlagSet));
    }

    let credentials = NetworkCredentials::load(store)?;
    if !credentials.configured {
        return Ok(BootDecision::Provision(ProvisionReason::NotConfigured));
    }
    if credentials.ssid.is_empty() {
        return Ok(BootDecision::Provision(ProvisionReason::EmptySsid));
    }

    let server = ServerConfig::load(store)?;
    if !server.is_provisioned() {
        return Ok(BootDecision::Provision(ProvisionReason::NoServerAddress));
    }

    Ok(BootDecision::Continue {
        credentials,
        server,
    })
}

/// Unrecoverable boot failures. The halt state is terminal; the only way
/// out is a power cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    StoreCorrupt(String),
    WifiFailed(String),
    DeviceNotRegistered,
    IdentityLookupExhausted(String),
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreCorrupt(detail) => {
                write!(f, "persistent store corrupt after reformat: {detail}")
            }
            Self::WifiFailed(detail) => write!(f, "wifi bring-up failed: {detail}"),
            Self::DeviceNotRegistered => write!(f, "device is not registered with the backend"),
            Self::IdentityLookupExhausted(detail) => {
                write!(f, "identity lookup retries exhausted: {detail}")
            }
        }
    }
}

impl HaltReason {
    /// The line logged every `HALT_LOG_INTERVAL_MS` while halted.
    pub fn log_line(&self) -> String {
        format!("SYSTEM HALTED: {self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::set_force_config_flag;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn provisioned_store() -> MemoryStore {
        let store = MemoryStore::new();
        NetworkCredentials {
            ssid: "home".to_string(),
            password: "pw".to_string(),
            configured: true,
        }
        .save(&store)
        .unwrap();
        ServerConfig::new("srv").save(&store).unwrap();
        store
    }

    #[test]
    fn blank_store_gates_into_provisioning() {
        let store = MemoryStore::new();
        assert_eq!(
            provisioning_gate(&store).unwrap(),
            BootDecision::Provision(ProvisionReason::NotConfigured)
        );
    }

    #[test]
    fn force_flag_wins_over_valid_config() {
        let store = provisioned_store();
        set_force_config_flag(&store).unwrap();
        assert_eq!(
            provisioning_gate(&store).unwrap(),
            BootDecision::Provision(ProvisionReason::ForceFlagSet)
        );
    }

    #[test]
    fn configured_without_server_address_provisions() {
        let store = MemoryStore::new();
        NetworkCredentials {
            ssid: "home".to_string(),
            password: "pw".to_string(),
            configured: true,
        }
        .save(&store)
        .unwrap();
        assert_eq!(
            provisioning_gate(&store).unwrap(),
            BootDecision::Provision(ProvisionReason::NoServerAddress)
        );
    }

    #[test]
    fn fully_provisioned_store_continues() {
        let store = provisioned_store();
        match provisioning_gate(&store).unwrap() {
            BootDecision::Continue {
                credentials,
                server,
            } => {
                assert_eq!(credentials.ssid, "home");
                assert_eq!(server.base_address, "http://srv");
            }
            other => panic!("expected continue, got {other:?}"),
        }
    }

    #[test]
    fn halt_log_line_format() {
        assert_eq!(
            HaltReason::DeviceNotRegistered.log_line(),
            "SYSTEM HALTED: device is not registered with the backend"
        );
    }
}
