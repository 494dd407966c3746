//! Data types for BLE entities.
//!
//! This module contains the core data structures used throughout the library:
//! - Device addresses
//! - GATT service model and operation targets
//! - Connection states
//! - Scan results

pub mod address;
pub mod gatt;
pub mod scan;
pub mod state;

pub use address::DeviceAddress;
pub(crate) use gatt::find_characteristic;
pub use gatt::{
    CCCD_UUID, CharProperties, CharacteristicTarget, GattCharacteristic, GattService, WriteKind,
};
pub use scan::{FinishReason, ScanEvent, ScanFilter, ScanResult};
pub use state::{ConnectionState, LinkEvent, StateKind};
