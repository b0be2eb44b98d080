use thiserror::Error;

/// Error kinds shared across the firmware. Variants map one-to-one onto the
/// stable error names surfaced in command result payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("not initialized: {0}")]
    NotInitialized(String),
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("auth error: {0}")]
    AuthError(String),
    #[error("wifi not connected: {0}")]
    WifiNotConnected(String),
    #[error("corrupt config: {0}")]
    CorruptConfig(String),
    #[error("remote rejected: {0}")]
    RemoteRejected(String),
}

impl HalError {
    /// Stable name used in JSON result payloads and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidParameter(_) => "INVALID_PARAMETER",
            Self::NotFound(_) => "NOT_FOUND",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::OutOfMemory(_) => "OUT_OF_MEMORY",
            Self::Busy(_) => "BUSY",
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::TransportError(_) => "TRANSPORT_ERROR",
            Self::AuthError(_) => "AUTH_ERROR",
            Self::WifiNotConnected(_) => "WIFI_NOT_CONNECTED",
            Self::CorruptConfig(_) => "CORRUPT_CONFIG",
            Self::RemoteRejected(_) => "REMOTE_REJECTED",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(HalError::invalid("x").name(), "INVALID_PARAMETER");
        assert_eq!(HalError::not_found("x").name(), "NOT_FOUND");
        assert_eq!(
            HalError::WifiNotConnected("no ip".into()).name(),
            "WIFI_NOT_CONNECTED"
        );
    }
}
