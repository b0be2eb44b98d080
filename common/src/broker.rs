//! Broker-client types shared between the host and esp transports: session
//! state, configuration, statistics and the payload/topic bounds.

use serde::Serialize;

use crate::error::HalError;

/// Hard cap on a single message payload. Longer payloads are truncated and
/// the truncation is counted in the statistics.
pub const MAX_PAYLOAD_BYTES: usize = 1024;
pub const MAX_TOPIC_BYTES: usize = 128;

pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Connection parameters for one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    pub clean_session: bool,
    pub auto_reconnect: bool,
}

impl BrokerConfig {
    pub fn new(host: &str, port: u16, client_id: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
            username: None,
            password: None,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            clean_session: true,
            auto_reconnect: true,
        }
    }
}

/// Session counters, updated from the broker I/O task. Readers tolerate
/// momentary inconsistency; there is no transactional view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub reconnects: u64,
    pub payloads_truncated: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BrokerStats {
    pub fn record_failure(&mut self, diagnosis: impl Into<String>) {
        self.messages_failed += 1;
        self.last_error = Some(diagnosis.into());
    }
}

pub fn validate_topic(topic: &str) -> Result<(), HalError> {
    if topic.is_empty() {
        return Err(HalError::invalid("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(HalError::invalid(format!(
            "topic length {} exceeds {MAX_TOPIC_BYTES} bytes",
            topic.len()
        )));
    }
    Ok(())
}

/// Applies the payload capacity, reporting whether truncation happened.
pub fn bound_payload(payload: &[u8]) -> (&[u8], bool) {
    if payload.len() > MAX_PAYLOAD_BYTES {
        (&payload[..MAX_PAYLOAD_BYTES], true)
    } else {
        (payload, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_session_policy() {
        let config = BrokerConfig::new("srv", 1883, "AIOT_246F28ABCDEF");
        assert_eq!(config.keepalive_secs, 60);
        assert_eq!(config.connect_timeout_secs, 5);
        assert!(config.clean_session);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn payload_at_capacity_is_not_truncated() {
        let payload = vec![0u8; MAX_PAYLOAD_BYTES];
        let (bounded, truncated) = bound_payload(&payload);
        assert_eq!(bounded.len(), MAX_PAYLOAD_BYTES);
        assert!(!truncated);
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let payload = vec![7u8; MAX_PAYLOAD_BYTES + 1];
        let (bounded, truncated) = bound_payload(&payload);
        assert_eq!(bounded.len(), MAX_PAYLOAD_BYTES);
        assert!(truncated);
    }

    #[test]
    fn topic_length_is_bounded() {
        assert!(validate_topic("aiot/device/U1/cmnd").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_BYTES)).is_ok());
        assert!(validate_topic(&"t".repeat(MAX_TOPIC_BYTES + 1)).is_err());
    }

    #[test]
    fn failure_updates_counters_and_diagnosis() {
        let mut stats = BrokerStats::default();
        stats.record_failure("connection reset");
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn qos_maps_to_wire_levels() {
        assert_eq!(QosLevel::AtMostOnce.as_u8(), 0);
        assert_eq!(QosLevel::AtLeastOnce.as_u8(), 1);
        assert_eq!(QosLevel::ExactlyOnce.as_u8(), 2);
    }
}
