//! # blelink
//!
//! An async Bluetooth Low Energy central core: discovery, a per-device
//! connection state machine with bounded reconnection, and a serialized GATT
//! operation queue.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Live connection state streams plus a broadcast log of every transition
//! - Writes split into MTU-sized packets, reads, notifications and indications
//! - Every operation resolves within its timeout, even if the stack never answers
//! - Platform seam ([`platform::BleAdapter`]) with an optional `btleplug` backend
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(feature = "btleplug")]
//! # async fn demo() -> Result<(), blelink::Error> {
//! use blelink::{BleManager, CharacteristicTarget, DeviceConfig, ScanEvent, ScanFilter, WriteKind};
//! use blelink::platform::BtleplugAdapter;
//!
//! let manager = BleManager::new(BtleplugAdapter::new().await?, DeviceConfig::default());
//!
//! // Find the strongest device whose name contains "sensor"
//! let mut scan = manager.start_scan(ScanFilter::names(["sensor"]))?;
//! let device = loop {
//!     if let Some(ScanEvent::Results(results)) = scan.recv().await {
//!         if let Some(first) = results.first() {
//!             break first.address;
//!         }
//!     }
//! };
//! manager.stop_scan();
//!
//! // Connect and wait until services are discovered
//! let mut state = manager.connect(device)?;
//! state.wait_for(|s| s.is_ready()).await;
//!
//! let target = CharacteristicTarget::new(
//!     device,
//!     "6e400001-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap(),
//!     "6e400002-b5a3-f393-e0a9-e50e24dcca9e".parse().unwrap(),
//! );
//! let written = manager.write_data(target, &b"hello"[..], WriteKind::Auto).await?;
//! println!("wrote {written} bytes");
//!
//! manager.release();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`store`] - Link table: state, session handle, MTU per device
//! - [`scan`] - Discovery with ageing, filtering and periodic snapshots
//! - [`connect`] - Connection state machine and reconnection
//! - [`communication`] - Serialized operation queue and callback correlation
//! - [`event`] - Broadcast of notifications, operation outcomes and transitions
//! - [`platform`] - Native adapter seam
//! - [`manager`] - The [`BleManager`] façade

pub mod communication;
pub mod config;
pub mod connect;
pub mod error;
pub mod event;
pub mod manager;
pub mod platform;
pub mod scan;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use communication::{CommunicationHandler, NotifyRequest};
pub use config::{CommunicateConfig, ConnectConfig, DeviceConfig, ReconnectConfig, ScanConfig};
pub use error::{Error, Result};
pub use event::{
    Event, EventDispatcher, EventFilter, EventKind, Notification, ReadOutcome, Subscription,
    WriteOutcome,
};
pub use manager::BleManager;
pub use platform::{BleAdapter, GattEvent, GattSession, GattStatus, Permission};
pub use scan::{ScanSubscription, Scanner};
pub use store::{CoreStore, StateStream};
pub use types::{
    CCCD_UUID, CharProperties, CharacteristicTarget, ConnectionState, DeviceAddress,
    FinishReason, GattCharacteristic, GattService, LinkEvent, ScanEvent, ScanFilter, ScanResult,
    StateKind, WriteKind,
};
