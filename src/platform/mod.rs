//! Platform layer for native Bluetooth access.
//!
//! This module provides the abstraction the core drives: a [`BleAdapter`] that
//! scans and opens sessions, and a [`GattSession`] per link. Native callbacks
//! flow back through [`ScanCallbacks`] and [`GattCallbacks`], which never block.

#[cfg(feature = "btleplug")]
mod desktop;
#[cfg(test)]
pub(crate) mod mock;
mod status;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::types::{DeviceAddress, GattService, ScanFilter, ScanResult, WriteKind};

#[cfg(feature = "btleplug")]
pub use desktop::BtleplugAdapter;
pub use status::GattStatus;

/// Runtime permission consulted before every native dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Permission to run discovery.
    Scan,
    /// Permission to connect and exchange data.
    Connect,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => f.write_str("bluetooth scan"),
            Self::Connect => f.write_str("bluetooth connect"),
        }
    }
}

/// A native call refused synchronously.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct DispatchError {
    pub reason: String,
}

impl DispatchError {
    /// Creates a dispatch error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<DispatchError> for crate::Error {
    fn from(err: DispatchError) -> Self {
        Self::DispatchFailed { reason: err.reason }
    }
}

/// Link-layer state reported by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayerState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Native GATT session callbacks, translated into one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// The link-layer connection changed.
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkLayerState,
    },
    /// Service discovery finished.
    ServicesDiscovered { status: GattStatus },
    /// The MTU exchange finished.
    MtuChanged { mtu: u16, status: GattStatus },
    /// A requested read finished.
    CharacteristicRead {
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        status: GattStatus,
    },
    /// A write with response was acknowledged.
    CharacteristicWrite {
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
    },
    /// A descriptor write (notification enable) finished.
    DescriptorWrite {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    /// An unsolicited notification or indication.
    CharacteristicChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
    },
}

/// Trait for native Bluetooth adapters.
pub trait BleAdapter: Send + Sync {
    /// Permission predicate. Called before every native dispatch.
    fn check_permission(&self, permission: Permission) -> bool {
        let _ = permission;
        true
    }

    /// Returns true if the adapter can resolve the address to a remote device.
    fn has_device(&self, address: &DeviceAddress) -> bool {
        let _ = address;
        true
    }

    /// Starts native discovery, reporting through `callbacks`.
    fn start_scan(&self, callbacks: ScanCallbacks) -> Result<(), DispatchError>;

    /// Stops native discovery.
    fn stop_scan(&self);

    /// Opens a GATT session to the device.
    ///
    /// Returns `None` if the stack could not create a session. Events for the
    /// session must be reported through `callbacks`.
    fn open_session(
        &self,
        address: &DeviceAddress,
        callbacks: GattCallbacks,
    ) -> Option<Arc<dyn GattSession>>;
}

/// Trait for one native GATT session.
///
/// Every request method dispatches and returns immediately; the outcome arrives
/// later as a [`GattEvent`].
pub trait GattSession: Send + Sync {
    /// Requests service discovery.
    fn discover_services(&self) -> Result<(), DispatchError>;

    /// Requests an MTU exchange.
    fn request_mtu(&self, mtu: u16) -> Result<(), DispatchError>;

    /// Returns the discovered service table (empty before discovery).
    fn services(&self) -> Vec<GattService>;

    /// Writes one packet to a characteristic.
    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        kind: WriteKind,
    ) -> Result<(), DispatchError>;

    /// Requests a characteristic read.
    fn read_characteristic(&self, service: Uuid, characteristic: Uuid)
    -> Result<(), DispatchError>;

    /// Enables notifications (or indications) and writes the configuration descriptor.
    fn enable_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        indicate: bool,
    ) -> Result<(), DispatchError>;

    /// Requests link teardown.
    fn disconnect(&self);

    /// Releases the native handle. No callbacks follow.
    fn close(&self);
}

/// Receiver of translated GATT events, implemented by the connector.
pub(crate) trait GattEventSink: Send + Sync {
    fn on_gatt_event(&self, address: DeviceAddress, generation: u64, event: GattEvent);
}

/// Callback handle given to [`BleAdapter::open_session`].
///
/// Cheap to clone; delivering after the core has been released is a no-op.
#[derive(Clone)]
pub struct GattCallbacks {
    address: DeviceAddress,
    generation: u64,
    sink: Weak<dyn GattEventSink>,
}

impl GattCallbacks {
    pub(crate) fn new(
        address: DeviceAddress,
        generation: u64,
        sink: Weak<dyn GattEventSink>,
    ) -> Self {
        Self {
            address,
            generation,
            sink,
        }
    }

    /// The device this session belongs to.
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Relays a native event into the core.
    pub fn deliver(&self, event: GattEvent) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_gatt_event(self.address, self.generation, event);
        } else {
            tracing::trace!("dropping gatt event for {}: core released", self.address);
        }
    }
}

impl std::fmt::Debug for GattCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattCallbacks")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Receiver of native scan failures, implemented by the scanner.
pub(crate) trait ScanFailureSink: Send + Sync {
    fn on_scan_failed(&self, session: u64, code: i32);
}

/// Callback handle given to [`BleAdapter::start_scan`].
///
/// Reports are filtered by name and pushed into a bounded buffer without
/// blocking; a full buffer drops the report.
#[derive(Clone)]
pub struct ScanCallbacks {
    session: u64,
    filter: Arc<ScanFilter>,
    reports: mpsc::Sender<ScanResult>,
    failures: Weak<dyn ScanFailureSink>,
}

impl ScanCallbacks {
    pub(crate) fn new(
        session: u64,
        filter: Arc<ScanFilter>,
        reports: mpsc::Sender<ScanResult>,
        failures: Weak<dyn ScanFailureSink>,
    ) -> Self {
        Self {
            session,
            filter,
            reports,
            failures,
        }
    }

    /// Reports one advertisement.
    pub fn on_result(&self, address: DeviceAddress, name: Option<String>, rssi: i16) {
        if !self.filter.matches(name.as_deref()) {
            return;
        }
        let report = ScanResult {
            address,
            name,
            rssi,
            last_seen: Instant::now(),
        };
        if let Err(e) = self.reports.try_send(report) {
            match e {
                mpsc::error::TrySendError::Full(r) => {
                    tracing::trace!("scan buffer full, dropping report from {}", r.address);
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    /// Reports that native discovery failed.
    pub fn on_failed(&self, code: i32) {
        if let Some(sink) = self.failures.upgrade() {
            sink.on_scan_failed(self.session, code);
        }
    }

    /// Returns true once the scan this handle belongs to has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.reports.is_closed()
    }
}

impl std::fmt::Debug for ScanCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCallbacks")
            .field("session", &self.session)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
