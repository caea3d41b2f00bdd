use thiserror::Error;
use uuid::Uuid;

use crate::protocol::ResultCode;

/// Stable classification of link-level failures.
///
/// btleplug reports platform-specific causes; these collapse onto a small
/// set so callers can branch without matching backend error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Radio or link-layer failure (adapter down, connection dropped mid-exchange)
    Radio,
    /// Permission or security failure (pairing rejected, adapter access denied)
    Permission,
    /// The peripheral could not be found or reached
    DeviceNotFound,
    /// The operation is invalid for the current link state
    InvalidState,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Radio => write!(f, "radio"),
            Self::Permission => write!(f, "permission"),
            Self::DeviceNotFound => write!(f, "device not found"),
            Self::InvalidState => write!(f, "invalid state"),
        }
    }
}

/// Errors that can occur when working with FTMS machines and heart rate monitors
#[derive(Error, Debug)]
pub enum FitlinkError {
    /// Link-level failure, classified into a stable transport taxonomy
    #[error("Transport error ({kind}): {message}")]
    Transport {
        /// Stable failure classification
        kind: TransportKind,
        /// Backend-provided detail
        message: String,
    },

    /// No matching device found during scanning
    #[error("Fitness device not found")]
    DeviceNotFound,

    /// Device disconnected or no connection is established
    #[error("Device disconnected")]
    Disconnected,

    /// A characteristic required by the profile is missing from the service
    #[error("Required characteristic {0} not found")]
    MissingCharacteristic(Uuid),

    /// A frame was shorter than its own flag field declared
    #[error("Malformed frame: needed {needed} bytes, got {got}")]
    MalformedFrame {
        /// Bytes the flags/opcode declared
        needed: usize,
        /// Bytes actually available
        got: usize,
    },

    /// A control point response echoed an opcode with no pending command
    #[error("Unexpected response: expected opcode {expected:#04X}, got {actual:#04X}")]
    UnexpectedResponse {
        /// Opcode of the pending command
        expected: u8,
        /// Opcode echoed by the device
        actual: u8,
    },

    /// The device rejected a command with a non-success result code
    #[error("Command rejected by device: {0}")]
    Rejected(ResultCode),

    /// No correlated response arrived within the armed window
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A queued command was cancelled before dispatch
    #[error("Command cancelled before dispatch")]
    Cancelled,

    /// Automatic reconnection gave up after exhausting the policy
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// IO error (device cache persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device cache serialization error
    #[error("Cache serialization error: {0}")]
    CacheFormat(#[from] serde_json::Error),
}

/// Result type for fitlink operations
pub type Result<T> = std::result::Result<T, FitlinkError>;

impl From<btleplug::Error> for FitlinkError {
    fn from(err: btleplug::Error) -> Self {
        let kind = match &err {
            btleplug::Error::PermissionDenied => TransportKind::Permission,
            btleplug::Error::DeviceNotFound => TransportKind::DeviceNotFound,
            btleplug::Error::NotConnected | btleplug::Error::InvalidBDAddr(_) => {
                TransportKind::InvalidState
            }
            _ => TransportKind::Radio,
        };
        Self::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

impl FitlinkError {
    /// Check if this error indicates a link-level failure
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::DeviceNotFound | Self::Disconnected
        )
    }

    /// Check if this error rejects only a single command without affecting
    /// the connection
    #[must_use]
    pub const fn is_command_error(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Timeout { .. } | Self::Cancelled | Self::InvalidParameters(_)
        )
    }

    /// Check if this error is recoverable by retrying
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = FitlinkError::Transport {
            kind: TransportKind::Radio,
            message: "adapter lost".to_string(),
        };
        assert!(transport.is_transport());
        assert!(!transport.is_command_error());

        let timeout = FitlinkError::Timeout { timeout_ms: 2500 };
        assert!(!timeout.is_transport());
        assert!(timeout.is_command_error());
        assert!(timeout.is_recoverable());

        let rejected = FitlinkError::Rejected(ResultCode::ControlNotPermitted);
        assert!(rejected.is_command_error());
        assert!(!rejected.is_recoverable());
    }

    #[test]
    fn test_btleplug_mapping() {
        let err: FitlinkError = btleplug::Error::PermissionDenied.into();
        assert!(matches!(
            err,
            FitlinkError::Transport {
                kind: TransportKind::Permission,
                ..
            }
        ));

        let err: FitlinkError = btleplug::Error::DeviceNotFound.into();
        assert!(matches!(
            err,
            FitlinkError::Transport {
                kind: TransportKind::DeviceNotFound,
                ..
            }
        ));

        let err: FitlinkError = btleplug::Error::NotConnected.into();
        assert!(matches!(
            err,
            FitlinkError::Transport {
                kind: TransportKind::InvalidState,
                ..
            }
        ));
    }

    #[test]
    fn test_error_display() {
        let error = FitlinkError::MalformedFrame { needed: 8, got: 6 };
        let text = format!("{error}");
        assert!(text.contains("needed 8"));
        assert!(text.contains("got 6"));
    }
}
