//! The failure taxonomy shared across the workspace.
//!
//! Operations in gattkeeper never surface errors as `Err` across the
//! scheduler boundary; they terminate with a typed status carried on the
//! corresponding event. The enums here are that vocabulary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an operation, connection attempt, or transaction failed.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new kinds
/// without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FailureKind {
    /// The call named no usable target.
    NullTarget,
    /// The device is not connected.
    NotConnected,
    /// No characteristic/descriptor matches the given fingerprint.
    NoMatchingTarget,
    /// The target exists but does not support the operation.
    OperationNotSupported,
    /// The operation's deadline elapsed.
    TimedOut,
    /// The remote GATT layer reported failure.
    RemoteGattFailure,
    /// Cancelled because the device was disconnected.
    CancelledFromDisconnect,
    /// Cancelled because the adapter turned off.
    CancelledFromBleTurningOff,
    /// Enabling or disabling a notification failed.
    FailedToToggleNotification,
    /// The local stack refused to stage the value.
    FailedToSetValueOnTarget,
    /// The running platform backend does not offer this capability.
    PlatformNotSupported,
    /// The stack or a session is busy with a conflicting operation.
    Busy,
    /// The authentication transaction failed.
    AuthenticationFailed,
    /// The initialization transaction failed.
    InitializationFailed,
    /// Bonding failed.
    BondFailed,
    /// The application asked for the disconnect.
    ExplicitDisconnect,
    /// The remote or the radio dropped the connection.
    RogueDisconnect,
    /// Service discovery failed.
    DiscoveringResourcesFailed,
}

impl FailureKind {
    /// Whether this failure should feed the reconnect controller rather
    /// than surface directly.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            FailureKind::TimedOut
                | FailureKind::RogueDisconnect
                | FailureKind::BondFailed
                | FailureKind::AuthenticationFailed
                | FailureKind::InitializationFailed
                | FailureKind::DiscoveringResourcesFailed
        )
    }
}

/// Status of a read/write-shaped event.
///
/// `Null` marks the synchronously returned placeholder for an accepted
/// call: the real outcome follows asynchronously. Any other value on a
/// synchronously returned event is the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum RwStatus {
    Null,
    Success,
    TimedOut,
    FailedToSetValueOnTarget,
    NullCharacteristic,
    NotConnected,
    NoMatchingTarget,
    OperationNotSupported,
    CancelledFromDisconnect,
    CancelledFromBleTurningOff,
    RemoteGattFailure,
    FailedToToggleNotification,
    Busy,
}

impl RwStatus {
    pub fn is_success(self) -> bool {
        self == RwStatus::Success
    }
}

/// Status of a bond/unbond event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum BondStatus {
    Null,
    Success,
    Failed,
    TimedOut,
    Cancelled,
    /// The requested bond state was already in place; no native call was
    /// issued.
    Redundant,
}

/// Errors from parsing wire-level or textual inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid MAC address: {0:?}")]
    InvalidMac(String),
    #[error("truncated advertisement structure at offset {offset}")]
    TruncatedAdStructure { offset: usize },
    #[error("invalid {what} length {len}")]
    InvalidLength { what: &'static str, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(FailureKind::TimedOut.is_connection_level());
        assert!(FailureKind::AuthenticationFailed.is_connection_level());
        assert!(!FailureKind::NoMatchingTarget.is_connection_level());
        assert!(!FailureKind::ExplicitDisconnect.is_connection_level());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&FailureKind::CancelledFromBleTurningOff).unwrap();
        assert_eq!(json, "\"cancelled_from_ble_turning_off\"");
        let json = serde_json::to_string(&RwStatus::NoMatchingTarget).unwrap();
        assert_eq!(json, "\"no_matching_target\"");
    }

    #[test]
    fn test_parse_error_display() {
        let e = ParseError::InvalidMac("nope".into());
        assert!(e.to_string().contains("nope"));
    }
}
