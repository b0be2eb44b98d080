//! MAC-to-UUID identity lookup protocol. The HTTP transport lives in the
//! firmware crate; this module owns the request shape, the lenient response
//! parse and the retry/terminal classification.

use serde::{Deserialize, Serialize};

use crate::board::BoardDescriptor;
use crate::config::{device_id_from_mac, DeviceIdentity};

pub const LOOKUP_RETRY_LIMIT: u32 = 3;
pub const LOOKUP_BACKOFF_MS: u64 = 2_000;
pub const LOOKUP_TIMEOUT_SECS: u64 = 10;

pub const DEVICE_TYPE: &str = "aiot-controller";
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Body of `POST /api/devices/mac/lookup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupRequest {
    pub mac_address: String,
    pub firmware_version: String,
    pub hardware_version: String,
    pub device_type: String,
}

impl LookupRequest {
    pub fn new(mac_address: &str, board: &BoardDescriptor) -> Self {
        Self {
            mac_address: mac_address.to_string(),
            firmware_version: FIRMWARE_VERSION.to_string(),
            hardware_version: board.hardware_version.clone(),
            device_type: DEVICE_TYPE.to_string(),
        }
    }
}

/// Lenient lookup response. Only `device_uuid` is strictly required; a
/// missing `device_id` falls back to the MAC-derived one.
#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_uuid: String,
    #[serde(default)]
    device_secret: String,
    #[serde(default)]
    mac_address: String,
}

/// What to do with one lookup attempt's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupDisposition {
    Resolved(DeviceIdentity),
    /// Transient server trouble or a malformed success body; retry with
    /// backoff up to the limit.
    Retry(String),
    /// The backend answered and the answer means "never": 404 for an
    /// unregistered device, or any other definitive client error.
    Terminal(String),
}

/// Classifies one HTTP response. Transport failures never reach this
/// function; callers classify those as `Retry` directly.
pub fn classify_response(status: u16, body: &[u8], mac: [u8; 6]) -> LookupDisposition {
    match status {
        200 => parse_identity(body, mac),
        404 => LookupDisposition::Terminal("device is not registered (404)".to_string()),
        429 => LookupDisposition::Retry("server busy (429)".to_string()),
        400..=499 => {
            LookupDisposition::Terminal(format!("lookup rejected with status {status}"))
        }
        other => LookupDisposition::Retry(format!("lookup failed with status {other}")),
    }
}

fn parse_identity(body: &[u8], mac: [u8; 6]) -> LookupDisposition {
    let response: LookupResponse = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return LookupDisposition::Retry(format!("malformed lookup response: {err}"));
        }
    };

    if response.device_uuid.is_empty() {
        return LookupDisposition::Retry("lookup response missing device_uuid".to_string());
    }

    let device_id = if response.device_id.is_empty() {
        device_id_from_mac(mac)
    } else {
        response.device_id
    };
    let mac_address = if response.mac_address.is_empty() {
        crate::config::format_mac(mac)
    } else {
        response.mac_address
    };

    LookupDisposition::Resolved(DeviceIdentity {
        device_id,
        device_uuid: response.device_uuid,
        device_secret: response.device_secret,
        mac_address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAC: [u8; 6] = [0x24, 0x6F, 0x28, 0xAB, 0xCD, 0xEF];

    #[test]
    fn request_carries_board_metadata() {
        let board = BoardDescriptor::aiot_board_v1();
        let request = LookupRequest::new("24:6F:28:AB:CD:EF", &board);
        assert_eq!(request.device_type, "aiot-controller");
        assert_eq!(request.hardware_version, board.hardware_version);
        assert!(!request.firmware_version.is_empty());
    }

    #[test]
    fn well_formed_200_resolves() {
        let body = br#"{"device_id":"D1","device_uuid":"U1","device_secret":"S1","mac_address":"24:6F:28:AB:CD:EF"}"#;
        let disposition = classify_response(200, body, MAC);
        assert_eq!(
            disposition,
            LookupDisposition::Resolved(DeviceIdentity {
                device_id: "D1".to_string(),
                device_uuid: "U1".to_string(),
                device_secret: "S1".to_string(),
                mac_address: "24:6F:28:AB:CD:EF".to_string(),
            })
        );
    }

    #[test]
    fn missing_device_id_falls_back_to_mac_derived() {
        let body = br#"{"device_uuid":"U1"}"#;
        match classify_response(200, body, MAC) {
            LookupDisposition::Resolved(identity) => {
                assert_eq!(identity.device_id, "AIOT_246F28ABCDEF");
                assert_eq!(identity.mac_address, "24:6F:28:AB:CD:EF");
                assert!(identity.device_secret.is_empty());
            }
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn missing_uuid_retries() {
        let body = br#"{"device_id":"D1"}"#;
        assert!(matches!(
            classify_response(200, body, MAC),
            LookupDisposition::Retry(_)
        ));
    }

    #[test]
    fn malformed_200_retries() {
        assert!(matches!(
            classify_response(200, b"<html>oops</html>", MAC),
            LookupDisposition::Retry(_)
        ));
    }

    #[test]
    fn not_registered_is_terminal() {
        assert!(matches!(
            classify_response(404, b"", MAC),
            LookupDisposition::Terminal(_)
        ));
    }

    #[test]
    fn server_errors_retry_and_client_errors_terminate() {
        assert!(matches!(
            classify_response(500, b"", MAC),
            LookupDisposition::Retry(_)
        ));
        assert!(matches!(
            classify_response(429, b"", MAC),
            LookupDisposition::Retry(_)
        ));
        assert!(matches!(
            classify_response(403, b"", MAC),
            LookupDisposition::Terminal(_)
        ));
    }
}
