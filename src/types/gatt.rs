//! GATT service model and operation targets.

use uuid::Uuid;

use crate::types::DeviceAddress;

/// Client Characteristic Configuration Descriptor, written to enable notifications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic property flags as advertised by the peripheral.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CharProperties(u8);

impl CharProperties {
    /// No properties.
    pub const NONE: Self = Self(0);

    /// Value may be broadcast.
    pub const BROADCAST: Self = Self(0x01);

    /// Value may be read.
    pub const READ: Self = Self(0x02);

    /// Value may be written without a response.
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);

    /// Value may be written with a response.
    pub const WRITE: Self = Self(0x08);

    /// Value changes may be notified.
    pub const NOTIFY: Self = Self(0x10);

    /// Value changes may be indicated.
    pub const INDICATE: Self = Self(0x20);

    /// Value may be written with a signature.
    pub const SIGNED_WRITE: Self = Self(0x40);

    /// Creates properties from the raw bitmask.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bitmask.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check if all flags in `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Returns the union of both flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for CharProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A characteristic exposed by a discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProperties,
    /// Descriptor UUIDs attached to the characteristic.
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// Returns true if the descriptor is present.
    #[must_use]
    pub fn has_descriptor(&self, descriptor: Uuid) -> bool {
        self.descriptors.contains(&descriptor)
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Looks up a characteristic by UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Pick from the characteristic properties: without-response when supported.
    #[default]
    Auto,
    /// Wait for the peripheral's write response.
    WithResponse,
    /// Fire the write; completion is reported on dispatch.
    WithoutResponse,
    /// Authenticated signed write.
    Signed,
}

impl WriteKind {
    /// Resolves [`WriteKind::Auto`] against the characteristic properties.
    #[must_use]
    pub const fn resolve(self, properties: CharProperties) -> Self {
        match self {
            Self::Auto => {
                if properties.contains(CharProperties::WRITE_WITHOUT_RESPONSE) {
                    Self::WithoutResponse
                } else {
                    Self::WithResponse
                }
            }
            other => other,
        }
    }

    /// Returns true if the write completes without an acknowledgement callback.
    #[must_use]
    pub const fn is_unacknowledged(self) -> bool {
        matches!(self, Self::WithoutResponse)
    }
}

/// The characteristic an operation is aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicTarget {
    pub address: DeviceAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicTarget {
    /// Creates a new target.
    #[must_use]
    pub const fn new(address: DeviceAddress, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            address,
            service,
            characteristic,
        }
    }
}

impl std::fmt::Display for CharacteristicTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service, self.characteristic)
    }
}

/// Finds a characteristic in a service table.
///
/// Returns `Err(true)` when the service is missing and `Err(false)` when only the
/// characteristic is.
pub(crate) fn find_characteristic(
    services: &[GattService],
    service: Uuid,
    characteristic: Uuid,
) -> Result<&GattCharacteristic, bool> {
    let svc = services.iter().find(|s| s.uuid == service).ok_or(true)?;
    svc.characteristic(characteristic).ok_or(false)
}
