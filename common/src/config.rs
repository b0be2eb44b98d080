use serde::{Deserialize, Serialize};

use crate::error::HalError;
use crate::store::{Store, StoreMode};

pub const NS_WIFI: &str = "wifi_config";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_CONFIGURED: &str = "configured";
pub const KEY_FORCE_CONFIG: &str = "force_config";

pub const NS_SERVER: &str = "server_config";
pub const KEY_BASE_ADDRESS: &str = "base_address";

pub const MAX_SSID_BYTES: usize = 31;
pub const MAX_PASSWORD_BYTES: usize = 63;

pub const DEFAULT_HTTP_PORT: u16 = 8000;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Station credentials captured by the captive portal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCredentials {
    pub ssid: String,
    pub password: String,
    pub configured: bool,
}

impl NetworkCredentials {
    pub fn validate(&self) -> Result<(), HalError> {
        if self.ssid.is_empty() {
            return Err(HalError::invalid("ssid is empty"));
        }
        if self.ssid.len() > MAX_SSID_BYTES {
            return Err(HalError::invalid(format!(
                "ssid exceeds {MAX_SSID_BYTES} bytes"
            )));
        }
        if self.password.len() > MAX_PASSWORD_BYTES {
            return Err(HalError::invalid(format!(
                "password exceeds {MAX_PASSWORD_BYTES} bytes"
            )));
        }
        Ok(())
    }

    pub fn load(store: &dyn Store) -> Result<Self, HalError> {
        let handle = store.open(NS_WIFI, StoreMode::ReadOnly)?;
        let ssid = match handle.get_str(KEY_WIFI_SSID) {
            Ok(value) => value,
            Err(HalError::NotFound(_)) => return Ok(Self::default()),
            Err(err) => return Err(err),
        };
        let password = match handle.get_str(KEY_WIFI_PASS) {
            Ok(value) => value,
            Err(HalError::NotFound(_)) => String::new(),
            Err(err) => return Err(err),
        };
        let configured = match handle.get_blob(KEY_CONFIGURED) {
            Ok(blob) => blob.first().copied() == Some(1),
            Err(HalError::NotFound(_)) => false,
            Err(err) => return Err(err),
        };
        Ok(Self {
            ssid,
            password,
            configured,
        })
    }

    pub fn save(&self, store: &dyn Store) -> Result<(), HalError> {
        self.validate()?;
        let mut handle = store.open(NS_WIFI, StoreMode::ReadWrite)?;
        handle.set_str(KEY_WIFI_SSID, &self.ssid)?;
        handle.set_str(KEY_WIFI_PASS, &self.password)?;
        handle.set_blob(KEY_CONFIGURED, &[u8::from(self.configured)])?;
        handle.commit()
    }
}

/// Reads the one-byte force-provisioning flag.
pub fn force_config_flag(store: &dyn Store) -> Result<bool, HalError> {
    let handle = store.open(NS_WIFI, StoreMode::ReadOnly)?;
    match handle.get_blob(KEY_FORCE_CONFIG) {
        Ok(blob) => Ok(blob.first().copied() == Some(1)),
        Err(HalError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Raised by a user intent (boot button); forces provisioning on next boot.
pub fn set_force_config_flag(store: &dyn Store) -> Result<(), HalError> {
    let mut handle = store.open(NS_WIFI, StoreMode::ReadWrite)?;
    handle.set_blob(KEY_FORCE_CONFIG, &[1])?;
    handle.commit()
}

/// Cleared by the portal handler after a successful provisioning POST.
pub fn clear_force_config_flag(store: &dyn Store) -> Result<(), HalError> {
    let mut handle = store.open(NS_WIFI, StoreMode::ReadWrite)?;
    handle.erase_key(KEY_FORCE_CONFIG)?;
    handle.commit()
}

/// Backend location. `base_address` always carries a scheme and no trailing
/// slash; it is normalized both on write and on read so a hand-edited store
/// still yields a well-formed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_address: String,
    pub http_port: u16,
    pub mqtt_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_address: String::new(),
            http_port: DEFAULT_HTTP_PORT,
            mqtt_port: DEFAULT_MQTT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn new(base_address: &str) -> Self {
        Self {
            base_address: normalize_base_address(base_address),
            ..Self::default()
        }
    }

    pub fn is_provisioned(&self) -> bool {
        !self.base_address.is_empty()
    }

    /// Host part of the base address, for the broker connection.
    pub fn host(&self) -> &str {
        let stripped = self
            .base_address
            .strip_prefix("http://")
            .or_else(|| self.base_address.strip_prefix("https://"))
            .unwrap_or(&self.base_address);
        stripped
            .split(['/', ':'])
            .next()
            .unwrap_or(stripped)
    }

    pub fn lookup_url(&self) -> String {
        format!(
            "{}:{}/api/devices/mac/lookup",
            self.base_address, self.http_port
        )
    }

    pub fn load(store: &dyn Store) -> Result<Self, HalError> {
        let handle = store.open(NS_SERVER, StoreMode::ReadOnly)?;
        match handle.get_str(KEY_BASE_ADDRESS) {
            Ok(raw) => Ok(Self::new(&raw)),
            Err(HalError::NotFound(_)) => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, store: &dyn Store) -> Result<(), HalError> {
        let normalized = normalize_base_address(&self.base_address);
        if normalized.is_empty() {
            return Err(HalError::invalid("base_address is empty"));
        }
        let mut handle = store.open(NS_SERVER, StoreMode::ReadWrite)?;
        handle.set_str(KEY_BASE_ADDRESS, &normalized)?;
        handle.commit()
    }
}

/// Trims whitespace, prepends `http://` when no scheme is present, and
/// strips trailing slashes. Idempotent.
pub fn normalize_base_address(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    with_scheme.trim_end_matches('/').to_string()
}

/// Identity issued by the backend at boot. `device_id` has a MAC-derived
/// fallback; the rest comes from the lookup response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_uuid: String,
    pub device_secret: String,
    pub mac_address: String,
}

/// `AIOT_` + uppercase hex of the six MAC bytes.
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    format!(
        "AIOT_{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

pub fn format_mac(mac: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn credentials_round_trip() {
        let store = MemoryStore::new();
        let saved = NetworkCredentials {
            ssid: "home".to_string(),
            password: "pw+1".to_string(),
            configured: true,
        };
        saved.save(&store).unwrap();
        let loaded = NetworkCredentials::load(&store).unwrap();
        assert_eq!(saved, loaded);
    }

    #[test]
    fn blank_store_loads_unconfigured() {
        let store = MemoryStore::new();
        let creds = NetworkCredentials::load(&store).unwrap();
        assert!(!creds.configured);
        assert!(creds.ssid.is_empty());
    }

    #[test]
    fn oversized_credentials_are_rejected() {
        let creds = NetworkCredentials {
            ssid: "s".repeat(32),
            password: String::new(),
            configured: true,
        };
        assert!(creds.validate().is_err());

        let creds = NetworkCredentials {
            ssid: "ok".to_string(),
            password: "p".repeat(64),
            configured: true,
        };
        assert!(creds.validate().is_err());
    }

    #[test]
    fn force_flag_set_and_clear() {
        let store = MemoryStore::new();
        assert!(!force_config_flag(&store).unwrap());
        set_force_config_flag(&store).unwrap();
        assert!(force_config_flag(&store).unwrap());
        clear_force_config_flag(&store).unwrap();
        assert!(!force_config_flag(&store).unwrap());
    }

    #[test]
    fn normalization_adds_scheme_and_strips_slash() {
        assert_eq!(normalize_base_address("example.com"), "http://example.com");
        assert_eq!(
            normalize_base_address("https://example.com/"),
            "https://example.com"
        );
        assert_eq!(
            normalize_base_address("  http://srv/  "),
            "http://srv"
        );
        assert_eq!(normalize_base_address(""), "");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["example.com", "http://a/", "https://b.c/x/", "  srv  "] {
            let once = normalize_base_address(raw);
            assert_eq!(normalize_base_address(&once), once);
        }
    }

    #[test]
    fn server_config_round_trip_normalizes_on_read() {
        let store = MemoryStore::new();
        ServerConfig::new("example.com/").save(&store).unwrap();
        let loaded = ServerConfig::load(&store).unwrap();
        assert_eq!(loaded.base_address, "http://example.com");
        assert_eq!(loaded.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(loaded.mqtt_port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn host_extraction() {
        assert_eq!(ServerConfig::new("example.com").host(), "example.com");
        assert_eq!(ServerConfig::new("https://srv").host(), "srv");
    }

    #[test]
    fn lookup_url_appends_http_port() {
        let config = ServerConfig::new("srv");
        assert_eq!(config.lookup_url(), "http://srv:8000/api/devices/mac/lookup");
    }

    #[test]
    fn device_id_format() {
        assert_eq!(
            device_id_from_mac([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef]),
            "AIOT_246F28ABCDEF"
        );
    }
}
