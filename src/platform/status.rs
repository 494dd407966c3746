//! Native GATT status codes.

/// A status code reported by the native stack.
///
/// Zero is success. Displayed as `Status(0x08): connection timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GattStatus(i32);

impl GattStatus {
    /// Operation completed.
    pub const SUCCESS: Self = Self(0);

    /// A session could not be opened at all.
    pub const SESSION_FAILED: Self = Self(-1);

    /// The link-layer connection timed out.
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);

    /// The remote device terminated the connection.
    pub const REMOTE_DISCONNECT: Self = Self(0x13);

    /// The local host terminated the connection.
    pub const LOCAL_HOST_DISCONNECT: Self = Self(0x16);

    /// Generic stack failure.
    pub const FAILURE: Self = Self(0x85);

    /// Wraps a raw status.
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// Returns the raw status.
    #[must_use]
    pub const fn code(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Human readable meaning of the status, if known.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self.0 {
            -1 => "session open failed",
            0 => "success",
            0x08 => "connection timeout",
            0x0d => "invalid data",
            0x13 => "remote device disconnected",
            0x16 => "local host disconnected",
            0x22 => "link layer response timeout",
            0x3e => "connection handshake failed",
            0x81 => "internal error",
            0x85 => "generic failure",
            0x101 => "system operation failed",
            _ => "unknown",
        }
    }
}

impl From<i32> for GattStatus {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < 0 {
            write!(f, "Status({}): {}", self.0, self.description())
        } else {
            write!(f, "Status(0x{:02X}): {}", self.0, self.description())
        }
    }
}
