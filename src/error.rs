//! Error types for the blelink library.

use thiserror::Error;
use uuid::Uuid;

use crate::platform::{GattStatus, Permission};
use crate::types::DeviceAddress;

/// The main error type for blelink operations.
///
/// Errors are `Clone` so that one operation outcome can be handed to the
/// caller and to broadcast subscribers at the same time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The platform permission predicate refused the operation.
    #[error("permission denied: {permission}")]
    PermissionDenied { permission: Permission },

    /// The adapter does not know the requested device.
    #[error("device not found: {address}")]
    DeviceNotFound { address: DeviceAddress },

    /// The configured number of concurrent links is already in use.
    #[error("connection limit of {max} devices exceeded")]
    ConnectLimitExceeded { max: usize },

    /// The native stack refused the request synchronously.
    #[error("dispatch failed: {reason}")]
    DispatchFailed { reason: String },

    /// No matching callback arrived before the deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The link dropped with a non-success native status.
    #[error("link lost: {status}")]
    AbnormalDisconnect { status: GattStatus },

    /// The operation was cancelled by eviction, disconnect, or teardown.
    #[error("operation cancelled")]
    Cancelled,

    /// No live session exists for the address.
    #[error("no active link for {address}")]
    LinkNotFound { address: DeviceAddress },

    /// The session exposes no such service.
    #[error("service not found: {service}")]
    ServiceNotFound { service: Uuid },

    /// The service exposes no such characteristic.
    #[error("characteristic not found: {characteristic}")]
    CharacteristicNotFound { characteristic: Uuid },

    /// The characteristic exposes no such descriptor.
    #[error("descriptor {descriptor} not found on {characteristic}")]
    DescriptorNotFound {
        characteristic: Uuid,
        descriptor: Uuid,
    },

    /// The native callback reported a failure status.
    #[error("GATT failure: {status}")]
    GattStatus { status: GattStatus },

    /// The platform has no usable Bluetooth adapter or scanner.
    #[error("bluetooth adapter unavailable: {reason}")]
    AdapterUnavailable { reason: String },

    /// A device address could not be parsed.
    #[error("invalid device address: {reason}")]
    InvalidAddress { reason: String },
}

impl Error {
    /// Builds a timeout error from a duration.
    #[must_use]
    pub fn timeout(timeout: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns true for the link / service / characteristic / descriptor absent family.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. }
                | Self::LinkNotFound { .. }
                | Self::ServiceNotFound { .. }
                | Self::CharacteristicNotFound { .. }
                | Self::DescriptorNotFound { .. }
        )
    }
}

/// Result type alias for blelink operations.
pub type Result<T> = std::result::Result<T, Error>;
