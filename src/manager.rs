//! The [`BleManager`] façade.
//!
//! Composes the core store, scanner, connector and operation queue behind one
//! handle that owns the whole lifecycle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::communication::{CommunicationHandler, NotifyRequest};
use crate::config::DeviceConfig;
use crate::connect::{Connector, ConnectorOptions};
use crate::error::{Error, Result};
use crate::event::{EventDispatcher, EventFilter, EventKind, Subscription};
use crate::platform::BleAdapter;
use crate::scan::{ScanSubscription, Scanner};
use crate::store::{CoreStore, StateStream};
use crate::types::{CharacteristicTarget, ConnectionState, DeviceAddress, ScanFilter, WriteKind};

/// Entry point for scanning, connecting and exchanging data with peripherals.
///
/// Dropping the manager releases it.
pub struct BleManager {
    core: Arc<CoreStore>,
    events: EventDispatcher,
    scanner: Scanner,
    connector: Connector,
    comms: CommunicationHandler,
    config: DeviceConfig,
}

impl BleManager {
    /// Creates a manager on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn new(adapter: impl BleAdapter + 'static, config: DeviceConfig) -> Self {
        Self::with_handle(Arc::new(adapter), config, Handle::current())
    }

    /// Creates a manager whose background tasks run on `handle`.
    #[must_use]
    pub fn with_handle(adapter: Arc<dyn BleAdapter>, config: DeviceConfig, handle: Handle) -> Self {
        let events = EventDispatcher::default();
        let core = Arc::new(CoreStore::new(&config.connect, events.clone()));
        let comms = CommunicationHandler::new(
            Arc::clone(&core),
            Arc::clone(&adapter),
            config.communicate.clone(),
            &handle,
        );
        let connector = Connector::new(
            Arc::clone(&core),
            Arc::clone(&adapter),
            comms.inbox(),
            ConnectorOptions {
                reconnect: config.reconnect.clone(),
                max_connections: config.connect.max_connections,
                target_mtu: config.communicate.mtu,
            },
            handle.clone(),
        );
        let scanner = Scanner::new(adapter, config.scan.clone(), handle, core.cancellation());

        tracing::debug!(
            "manager created, max {} links, mtu {}",
            config.connect.max_connections,
            config.communicate.mtu
        );

        Self {
            core,
            events,
            scanner,
            connector,
            comms,
            config,
        }
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn ensure_live(&self) -> Result<()> {
        if self.core.is_released() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    // ===== Scanning =====

    /// Starts scanning with the configured timeout, or joins the running scan.
    pub fn start_scan(&self, filter: ScanFilter) -> Result<ScanSubscription> {
        self.ensure_live()?;
        self.scanner.start_scan(filter, None)
    }

    /// Starts scanning with an explicit timeout.
    pub fn start_scan_for(&self, filter: ScanFilter, timeout: Duration) -> Result<ScanSubscription> {
        self.ensure_live()?;
        self.scanner.start_scan(filter, Some(timeout))
    }

    /// Stops the running scan. Returns false if none was running.
    pub fn stop_scan(&self) -> bool {
        self.scanner.stop_scan()
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    // ===== Links =====

    /// Connects to a device and returns its state stream.
    ///
    /// Connecting an address that is already active returns its existing
    /// stream.
    pub fn connect(&self, address: DeviceAddress) -> Result<StateStream> {
        self.ensure_live()?;
        self.connector.connect(address)
    }

    /// Disconnects a device. Returns false if it had no link.
    pub fn disconnect(&self, address: DeviceAddress) -> bool {
        self.connector.disconnect(address)
    }

    /// Current state of a device; `Idle` if unknown.
    #[must_use]
    pub fn state(&self, address: DeviceAddress) -> ConnectionState {
        self.core.state(address)
    }

    /// Live state stream for a device, valid before the first connect.
    pub fn state_stream(&self, address: DeviceAddress) -> StateStream {
        self.core.state_stream(address)
    }

    /// State stream of the current device in single-link mode.
    ///
    /// Outside single-link mode this falls back to the lowest non-idle address.
    #[must_use]
    pub fn single_state_stream(&self) -> Option<StateStream> {
        self.core
            .single_address()
            .map(|address| self.core.state_stream(address))
    }

    /// Returns true once the link is ready for operations.
    #[must_use]
    pub fn is_connected(&self, address: DeviceAddress) -> bool {
        self.core.state(address).is_ready()
    }

    /// Snapshot of every link that has left `Idle`, ordered by address.
    #[must_use]
    pub fn links(&self) -> Vec<(DeviceAddress, ConnectionState)> {
        self.core.links()
    }

    /// Reconnection attempts made since the link was last ready.
    #[must_use]
    pub fn retry_count(&self, address: DeviceAddress) -> u32 {
        self.connector.retry_count(address)
    }

    // ===== Operations =====

    /// Writes a payload, split into packets that fit the negotiated MTU.
    ///
    /// Returns the number of payload bytes written.
    pub async fn write_data(
        &self,
        target: CharacteristicTarget,
        payload: impl Into<Bytes>,
        kind: WriteKind,
    ) -> Result<usize> {
        self.comms.write(target, payload, kind).await
    }

    /// Queues a write and reports its result through `callback`.
    pub fn write_data_with(
        &self,
        target: CharacteristicTarget,
        payload: impl Into<Bytes>,
        kind: WriteKind,
        callback: impl FnOnce(Result<usize>) + Send + 'static,
    ) {
        self.comms.write_with(target, payload, kind, callback);
    }

    pub async fn read_data(&self, target: CharacteristicTarget) -> Result<Bytes> {
        self.comms.read(target).await
    }

    pub fn read_data_with(
        &self,
        target: CharacteristicTarget,
        callback: impl FnOnce(Result<Bytes>) + Send + 'static,
    ) {
        self.comms.read_with(target, callback);
    }

    /// Subscribes to notifications or indications on a characteristic.
    ///
    /// Values arrive on [`notifications`](Self::notifications).
    pub async fn enable_notification(
        &self,
        target: CharacteristicTarget,
        request: NotifyRequest,
    ) -> Result<()> {
        self.comms.enable_notification(target, request).await
    }

    pub fn enable_notification_with(
        &self,
        target: CharacteristicTarget,
        request: NotifyRequest,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.comms
            .enable_notification_with(target, request, callback);
    }

    /// Rate limits notifications for one characteristic. `None` removes the limit.
    pub fn set_notification_interval(
        &self,
        address: DeviceAddress,
        characteristic: Uuid,
        interval: Option<Duration>,
    ) {
        self.comms
            .set_notification_interval(address, characteristic, interval);
    }

    // ===== Streams =====

    /// Notification values from every link.
    #[must_use]
    pub fn notifications(&self) -> Subscription {
        self.subscribe(EventFilter::kind(EventKind::Notification))
    }

    /// Outcome of every completed read, including failures.
    #[must_use]
    pub fn read_results(&self) -> Subscription {
        self.subscribe(EventFilter::kind(EventKind::Read))
    }

    /// Outcome of every completed write, including failures.
    #[must_use]
    pub fn write_results(&self) -> Subscription {
        self.subscribe(EventFilter::kind(EventKind::Write))
    }

    /// Every state transition on every link.
    #[must_use]
    pub fn link_events(&self) -> Subscription {
        self.subscribe(EventFilter::kind(EventKind::Link))
    }

    /// Events matching an arbitrary filter.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.events.subscribe(Some(filter))
    }

    // ===== Lifecycle =====

    /// Stops the scan, cancels every operation and closes every session.
    ///
    /// Idempotent. The manager rejects new scans and connects afterwards.
    pub fn release(&self) {
        if self.core.is_released() {
            return;
        }
        self.scanner.stop_scan();
        self.connector.release();
        self.core.release();
        self.comms.inbox().cancel_all();
        tracing::info!("manager released");
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.core.is_released()
    }
}

impl Drop for BleManager {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleManager")
            .field("core", &self.core)
            .field("scanner", &self.scanner)
            .field("comms", &self.comms)
            .finish_non_exhaustive()
    }
}
