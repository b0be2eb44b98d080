use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::config::{clear_force_config_flag, NetworkCredentials, ServerConfig};
use crate::error::HalError;
use crate::store::Store;

/// Gateway address of the soft-AP; the DNS hijack resolves everything here.
pub const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
pub const AP_CHANNEL: u8 = 1;
pub const AP_MAX_STATIONS: u8 = 4;
pub const PORTAL_ROOT_URL: &str = "http://192.168.4.1/";

/// OS connectivity probes that must be redirected for the captive portal
/// prompt to appear.
pub const PROBE_PATHS: &[&str] = &[
    "/hotspot-detect.html",
    "/generate_204",
    "/gen_204",
    "/connecttest.txt",
    "/ncsi.txt",
    "/success.txt",
    "/library/test/success.html",
];

pub fn is_probe_path(path: &str) -> bool {
    PROBE_PATHS.contains(&path)
}

/// Whether an HTTP `Host` header addresses the portal itself. Anything else
/// (hijacked DNS resolves every name to the AP address) gets a 302 to
/// [`PORTAL_ROOT_URL`].
pub fn is_portal_host(host: Option<&str>) -> bool {
    match host {
        Some(host) => {
            let bare = host.split(':').next().unwrap_or(host);
            bare == AP_IP.to_string()
        }
        None => false,
    }
}

/// Provisioning AP SSID, derived from the station MAC (not the AP MAC) so
/// it matches the device label: `AIOT-Config-` + last three bytes uppercase.
pub fn ap_ssid_from_mac(mac: [u8; 6]) -> String {
    format!("AIOT-Config-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}

/// Captive portal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Idle,
    ApStarting,
    ApStarted,
    /// A client joined and the form was served.
    Configuring,
    /// Valid POST persisted; reboot pending.
    CommittedPendingReboot,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalError {
    MissingField(&'static str),
    BadPayload(String),
}

impl PortalError {
    pub fn message(&self) -> String {
        match self {
            Self::MissingField(field) => format!("missing required field `{field}`"),
            Self::BadPayload(message) => message.clone(),
        }
    }
}

/// Decoded `POST /config` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub ssid: String,
    pub password: String,
    pub server_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProvisioningJson {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    server_address: String,
}

/// Stored values echoed by `GET /config/current`.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentConfig {
    pub ssid: String,
    pub password: String,
    pub server_address: String,
}

/// Standard URL decoding: `%HH` escapes, `+` becomes space.
pub fn url_decode(input: &str) -> String {
    decode(input, true)
}

/// Password variant: `%HH` escapes only, `+` is kept literally so wifi
/// passwords containing `+` survive form submission.
pub fn url_decode_preserve_plus(input: &str) -> String {
    decode(input, false)
}

fn decode(input: &str, plus_is_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|pair| {
                    let high = (pair[0] as char).to_digit(16)?;
                    let low = (pair[1] as char).to_digit(16)?;
                    Some((high * 16 + low) as u8)
                }) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_is_space => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a provisioning POST body, JSON or form-encoded by content type.
/// Fields are trimmed of surrounding whitespace and newlines; empty `ssid`
/// or `server_address` is rejected with no state change.
pub fn parse_config_request(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<ProvisioningRequest, PortalError> {
    let is_json = content_type
        .map(|value| value.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);

    let (ssid, password, server_address) = if is_json {
        let parsed: ProvisioningJson = serde_json::from_slice(body)
            .map_err(|err| PortalError::BadPayload(format!("invalid json body: {err}")))?;
        (parsed.ssid, parsed.password, parsed.server_address)
    } else {
        let text = std::str::from_utf8(body)
            .map_err(|_| PortalError::BadPayload("form body is not utf-8".to_string()))?;
        let mut ssid = String::new();
        let mut password = String::new();
        let mut server_address = String::new();
        for pair in text.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = url_decode(parts.next().unwrap_or_default());
            let raw_value = parts.next().unwrap_or_default();
            match key.as_str() {
                "ssid" => ssid = url_decode(raw_value),
                "password" => password = url_decode_preserve_plus(raw_value),
                "server_address" => server_address = url_decode(raw_value),
                _ => {}
            }
        }
        (ssid, password, server_address)
    };

    let ssid = ssid.trim().to_string();
    let password = password.trim_matches(['\r', '\n']).to_string();
    let server_address = server_address.trim().to_string();

    if ssid.is_empty() {
        return Err(PortalError::MissingField("ssid"));
    }
    if server_address.is_empty() {
        return Err(PortalError::MissingField("server_address"));
    }

    Ok(ProvisioningRequest {
        ssid,
        password,
        server_address,
    })
}

/// Persists a valid provisioning request: credentials to `wifi_config`, the
/// normalized server address to `server_config`, then clears the force flag.
pub fn commit_provisioning(
    store: &dyn Store,
    request: &ProvisioningRequest,
) -> Result<(), HalError> {
    let credentials = NetworkCredentials {
        ssid: request.ssid.clone(),
        password: request.password.clone(),
        configured: true,
    };
    credentials.save(store)?;

    ServerConfig::new(&request.server_address).save(store)?;
    clear_force_config_flag(store)?;
    Ok(())
}

pub fn current_config(store: &dyn Store) -> Result<CurrentConfig, HalError> {
    let credentials = NetworkCredentials::load(store)?;
    let server = ServerConfig::load(store)?;
    Ok(CurrentConfig {
        ssid: credentials.ssid,
        password: credentials.password,
        server_address: server.base_address,
    })
}

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>AIoT Device Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:8px;padding:1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}.muted{color:#555}
  </style>
</head>
<body>
  <h1>AIoT Device Setup</h1>
  <p class="muted">Enter your WiFi network and the server this device should report to.</p>
  <div class="card">
    <form method="POST" action="/config">
      <label>WiFi SSID</label><input name="ssid" type="text" required>
      <label>WiFi Password</label><input name="password" type="password">
      <label>Server Address</label><input name="server_address" type="text" placeholder="example.com">
      <button type="submit">Save and Restart</button>
    </form>
  </div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{force_config_flag, set_force_config_flag};
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    #[test]
    fn ap_ssid_uses_last_three_mac_bytes() {
        let ssid = ap_ssid_from_mac([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef]);
        assert_eq!(ssid, "AIOT-Config-ABCDEF");
    }

    #[test]
    fn probe_paths_match() {
        assert!(is_probe_path("/generate_204"));
        assert!(is_probe_path("/hotspot-detect.html"));
        assert!(!is_probe_path("/"));
        assert!(!is_probe_path("/config"));
    }

    #[test]
    fn only_the_ap_address_counts_as_portal_host() {
        assert!(is_portal_host(Some("192.168.4.1")));
        assert!(is_portal_host(Some("192.168.4.1:80")));
        assert!(!is_portal_host(Some("connectivitycheck.gstatic.com")));
        assert!(!is_portal_host(Some("example.com:8080")));
        assert!(!is_portal_host(None));
    }

    #[test]
    fn standard_decode_turns_plus_into_space() {
        assert_eq!(url_decode("my+home+net"), "my home net");
        assert_eq!(url_decode("a%2Fb%20c"), "a/b c");
    }

    #[test]
    fn password_decode_preserves_plus() {
        assert_eq!(url_decode_preserve_plus("pw+1"), "pw+1");
        assert_eq!(url_decode_preserve_plus("pw%2B1"), "pw+1");
    }

    #[test]
    fn malformed_escape_passes_through() {
        assert_eq!(url_decode("100%"), "100%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn json_body_parses() {
        let body = br#"{"ssid":"home","password":"pw+1","server_address":"example.com"}"#;
        let request = parse_config_request(Some("application/json"), body).unwrap();
        assert_eq!(request.ssid, "home");
        assert_eq!(request.password, "pw+1");
        assert_eq!(request.server_address, "example.com");
    }

    #[test]
    fn form_body_parses_with_password_plus_preserved() {
        let body = b"ssid=my+net&password=pw+1&server_address=example.com%2F";
        let request = parse_config_request(
            Some("application/x-www-form-urlencoded"),
            body,
        )
        .unwrap();
        assert_eq!(request.ssid, "my net");
        assert_eq!(request.password, "pw+1");
        assert_eq!(request.server_address, "example.com/");
    }

    #[test]
    fn fields_are_trimmed() {
        let body = br#"{"ssid":"  home \n","password":"pw","server_address":" srv \n"}"#;
        let request = parse_config_request(Some("application/json"), body).unwrap();
        assert_eq!(request.ssid, "home");
        assert_eq!(request.server_address, "srv");
    }

    #[test]
    fn empty_required_fields_are_rejected() {
        let body = br#"{"ssid":"","password":"x","server_address":"srv"}"#;
        assert_eq!(
            parse_config_request(Some("application/json"), body),
            Err(PortalError::MissingField("ssid"))
        );

        let body = br#"{"ssid":"home","password":"x","server_address":"  "}"#;
        assert_eq!(
            parse_config_request(Some("application/json"), body),
            Err(PortalError::MissingField("server_address"))
        );
    }

    #[test]
    fn commit_persists_and_clears_force_flag() {
        let store = MemoryStore::new();
        set_force_config_flag(&store).unwrap();

        let request = ProvisioningRequest {
            ssid: "home".to_string(),
            password: "pw+1".to_string(),
            server_address: "example.com".to_string(),
        };
        commit_provisioning(&store, &request).unwrap();

        let credentials = NetworkCredentials::load(&store).unwrap();
        assert!(credentials.configured);
        assert_eq!(credentials.ssid, "home");
        assert_eq!(credentials.password, "pw+1");

        let server = ServerConfig::load(&store).unwrap();
        assert_eq!(server.base_address, "http://example.com");

        assert!(!force_config_flag(&store).unwrap());
    }

    #[test]
    fn invalid_request_leaves_store_untouched() {
        let store = MemoryStore::new();
        let body = br#"{"ssid":"","server_address":"srv"}"#;
        assert!(parse_config_request(Some("application/json"), body).is_err());
        assert!(!NetworkCredentials::load(&store).unwrap().configured);
    }

    #[test]
    fn current_config_on_blank_store_is_empty() {
        let store = MemoryStore::new();
        let current = current_config(&store).unwrap();
        assert!(current.ssid.is_empty());
        assert!(current.server_address.is_empty());
    }
}
