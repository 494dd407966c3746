//! Device address type.

use std::str::FromStr;

use crate::error::Error;

/// Length of a Bluetooth device address in bytes.
pub const ADDRESS_LEN: usize = 6;

/// A 48-bit Bluetooth device address, the identity of a peripheral.
///
/// Displayed as `AA:BB:CC:DD:EE:FF`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; ADDRESS_LEN]);

impl DeviceAddress {
    /// Creates an address from its six octets, most significant first.
    #[must_use]
    pub const fn new(octets: [u8; ADDRESS_LEN]) -> Self {
        Self(octets)
    }

    /// Returns the address octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; ADDRESS_LEN] {
        self.0
    }

    /// Parses an address from `AA:BB:CC:DD:EE:FF`, `AA-BB-...` or bare hex.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not 12 hex digits once separators are removed.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|e| Error::InvalidAddress {
            reason: format!("{s}: {e}"),
        })?;
        let octets: [u8; ADDRESS_LEN] =
            bytes.try_into().map_err(|_| Error::InvalidAddress {
                reason: format!("{s}: expected {ADDRESS_LEN} octets"),
            })?;
        Ok(Self(octets))
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<[u8; ADDRESS_LEN]> for DeviceAddress {
    fn from(octets: [u8; ADDRESS_LEN]) -> Self {
        Self(octets)
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl std::fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceAddress({self})")
    }
}
