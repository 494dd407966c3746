//! [`BleAdapter`] on top of `btleplug`, for Linux, macOS and Windows hosts.
//!
//! `btleplug` is async while the adapter seam is callback based, so every
//! session runs one worker task that executes requests in submission order
//! and turns their outcomes into [`GattEvent`]s. One pump task per adapter
//! follows the central event stream for advertisements and link loss.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as NativeScanFilter, Service, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    BleAdapter, DispatchError, GattCallbacks, GattEvent, GattSession, GattStatus, LinkLayerState,
    ScanCallbacks,
};
use crate::error::{Error, Result};
use crate::types::{
    CCCD_UUID, CharProperties, DeviceAddress, GattCharacteristic, GattService, WriteKind,
};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn unavailable(e: btleplug::Error) -> Error {
    Error::AdapterUnavailable {
        reason: e.to_string(),
    }
}

fn address_of(peripheral: &Peripheral) -> DeviceAddress {
    DeviceAddress::new(peripheral.address().into_inner())
}

fn convert_characteristic(characteristic: Characteristic) -> GattCharacteristic {
    let mut descriptors: Vec<Uuid> = characteristic
        .descriptors
        .into_iter()
        .map(|d| d.uuid)
        .collect();
    // some backends keep the configuration descriptor to themselves
    let notifies = characteristic
        .properties
        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE);
    if notifies && !descriptors.contains(&CCCD_UUID) {
        descriptors.push(CCCD_UUID);
    }
    GattCharacteristic {
        uuid: characteristic.uuid,
        properties: CharProperties::from_bits(characteristic.properties.bits()),
        descriptors,
    }
}

fn convert_service(service: Service) -> GattService {
    GattService {
        uuid: service.uuid,
        characteristics: service
            .characteristics
            .into_iter()
            .map(convert_characteristic)
            .collect(),
    }
}

// ===== Adapter =====

struct AdapterInner {
    adapter: Adapter,
    handle: Handle,
    known: Mutex<HashMap<DeviceAddress, Peripheral>>,
    scan: Mutex<Option<ScanCallbacks>>,
    sessions: Mutex<HashMap<DeviceAddress, Weak<SessionShared>>>,
    cancel: CancellationToken,
}

/// Host Bluetooth adapter driven through `btleplug`.
///
/// Devices become connectable once a scan has reported them.
pub struct BtleplugAdapter {
    inner: Arc<AdapterInner>,
}

impl BtleplugAdapter {
    /// Opens the first Bluetooth adapter of the host.
    ///
    /// # Errors
    ///
    /// Returns `AdapterUnavailable` if the host has no usable adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(unavailable)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AdapterUnavailable {
                reason: "no bluetooth adapter found".into(),
            })?;
        Self::with_adapter(adapter, Handle::current()).await
    }

    /// Wraps an already selected adapter.
    ///
    /// # Errors
    ///
    /// Returns `AdapterUnavailable` if the adapter's event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter, handle: Handle) -> Result<Self> {
        let events = adapter.events().await.map_err(unavailable)?;
        let inner = Arc::new(AdapterInner {
            adapter,
            handle: handle.clone(),
            known: Mutex::new(HashMap::new()),
            scan: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        handle.spawn(pump(Arc::downgrade(&inner), events, inner.cancel.clone()));
        Ok(Self { inner })
    }
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl std::fmt::Debug for BtleplugAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugAdapter")
            .field("known", &self.inner.known.lock().len())
            .field("scanning", &self.inner.scan.lock().is_some())
            .finish_non_exhaustive()
    }
}

async fn pump(inner: Weak<AdapterInner>, mut events: CentralEvents, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        let Some(inner) = inner.upgrade() else { break };
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                inner.report(&id).await;
            }
            CentralEvent::DeviceDisconnected(id) => inner.link_dropped(&id).await,
            _ => {}
        }
    }
    tracing::debug!("btleplug event pump stopped");
}

impl AdapterInner {
    async fn report(&self, id: &PeripheralId) {
        let peripheral = match self.adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                tracing::trace!("advertisement from unknown peripheral: {}", e);
                return;
            }
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            Ok(None) => return,
            Err(e) => {
                tracing::trace!("no properties for {}: {}", peripheral.address(), e);
                return;
            }
        };
        let address = address_of(&peripheral);
        self.known.lock().insert(address, peripheral);

        let callbacks = self.scan.lock().clone();
        let (Some(callbacks), Some(rssi)) = (callbacks, properties.rssi) else {
            return;
        };
        callbacks.on_result(address, properties.local_name, rssi);
    }

    async fn link_dropped(&self, id: &PeripheralId) {
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let address = address_of(&peripheral);
        let session = self.sessions.lock().get(&address).and_then(Weak::upgrade);
        if let Some(session) = session {
            session.remote_disconnect();
        }
    }
}

impl BleAdapter for BtleplugAdapter {
    fn has_device(&self, address: &DeviceAddress) -> bool {
        self.inner.known.lock().contains_key(address)
    }

    fn start_scan(&self, callbacks: ScanCallbacks) -> std::result::Result<(), DispatchError> {
        if self.inner.cancel.is_cancelled() {
            return Err(DispatchError::new("adapter dropped"));
        }
        *self.inner.scan.lock() = Some(callbacks.clone());
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            if let Err(e) = inner.adapter.start_scan(NativeScanFilter::default()).await {
                tracing::warn!("btleplug scan failed to start: {}", e);
                inner.scan.lock().take();
                callbacks.on_failed(GattStatus::FAILURE.code());
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        if self.inner.scan.lock().take().is_none() {
            return;
        }
        let adapter = self.inner.adapter.clone();
        self.inner.handle.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                tracing::debug!("btleplug scan stop failed: {}", e);
            }
        });
    }

    fn open_session(
        &self,
        address: &DeviceAddress,
        callbacks: GattCallbacks,
    ) -> Option<Arc<dyn GattSession>> {
        let Some(peripheral) = self.inner.known.lock().get(address).cloned() else {
            tracing::warn!("{} has not been seen by a scan", address);
            return None;
        };
        let shared = Arc::new(SessionShared {
            address: *address,
            peripheral,
            callbacks,
            closed: AtomicBool::new(false),
            local_disconnect: AtomicBool::new(false),
            cancel: self.inner.cancel.child_token(),
        });
        self.inner
            .sessions
            .lock()
            .insert(*address, Arc::downgrade(&shared));

        let (requests, rx) = mpsc::unbounded_channel();
        self.inner.handle.spawn(run_session(Arc::clone(&shared), rx));
        Some(Arc::new(BtleplugSession { shared, requests }))
    }
}

// ===== Session =====

enum Request {
    Discover,
    Write {
        characteristic: Characteristic,
        value: Bytes,
        kind: WriteType,
        acknowledged: bool,
    },
    Read {
        characteristic: Characteristic,
    },
    Subscribe {
        characteristic: Characteristic,
        descriptor: Uuid,
    },
    Disconnect,
}

struct SessionShared {
    address: DeviceAddress,
    peripheral: Peripheral,
    callbacks: GattCallbacks,
    closed: AtomicBool,
    local_disconnect: AtomicBool,
    cancel: CancellationToken,
}

impl SessionShared {
    fn emit(&self, event: GattEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            self.callbacks.deliver(event);
        }
    }

    fn remote_disconnect(&self) {
        if self.local_disconnect.load(Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.emit(GattEvent::ConnectionStateChanged {
            status: GattStatus::REMOTE_DISCONNECT,
            state: LinkLayerState::Disconnected,
        });
    }

    fn status(&self, what: &str, result: btleplug::Result<()>) -> GattStatus {
        match result {
            Ok(()) => GattStatus::SUCCESS,
            Err(e) => {
                tracing::warn!("{} on {} failed: {}", what, self.address, e);
                GattStatus::FAILURE
            }
        }
    }

    fn notified(&self, notification: ValueNotification) {
        let service = self
            .peripheral
            .characteristics()
            .iter()
            .find(|c| c.uuid == notification.uuid)
            .map_or(Uuid::nil(), |c| c.service_uuid);
        self.emit(GattEvent::CharacteristicChanged {
            service,
            characteristic: notification.uuid,
            value: Bytes::from(notification.value),
        });
    }

    /// Executes one request. Returns false once the link is gone.
    async fn execute(&self, request: Request) -> bool {
        match request {
            Request::Discover => {
                let status = self.status("discovery", self.peripheral.discover_services().await);
                self.emit(GattEvent::ServicesDiscovered { status });
            }
            Request::Write {
                characteristic,
                value,
                kind,
                acknowledged,
            } => {
                let status = self.status(
                    "write",
                    self.peripheral.write(&characteristic, &value, kind).await,
                );
                if acknowledged {
                    self.emit(GattEvent::CharacteristicWrite {
                        service: characteristic.service_uuid,
                        characteristic: characteristic.uuid,
                        status,
                    });
                }
            }
            Request::Read { characteristic } => {
                let (value, status) = match self.peripheral.read(&characteristic).await {
                    Ok(value) => (Bytes::from(value), GattStatus::SUCCESS),
                    Err(e) => {
                        tracing::warn!("read on {} failed: {}", self.address, e);
                        (Bytes::new(), GattStatus::FAILURE)
                    }
                };
                self.emit(GattEvent::CharacteristicRead {
                    service: characteristic.service_uuid,
                    characteristic: characteristic.uuid,
                    value,
                    status,
                });
            }
            Request::Subscribe {
                characteristic,
                descriptor,
            } => {
                let status = self.status(
                    "subscribe",
                    self.peripheral.subscribe(&characteristic).await,
                );
                self.emit(GattEvent::DescriptorWrite {
                    service: characteristic.service_uuid,
                    characteristic: characteristic.uuid,
                    descriptor,
                    status,
                });
            }
            Request::Disconnect => {
                if let Err(e) = self.peripheral.disconnect().await {
                    tracing::debug!("disconnect from {} failed: {}", self.address, e);
                }
                self.emit(GattEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    state: LinkLayerState::Disconnected,
                });
                return false;
            }
        }
        true
    }
}

async fn next_notification(stream: &mut Option<Notifications>) -> Option<ValueNotification> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn run_session(shared: Arc<SessionShared>, mut requests: mpsc::UnboundedReceiver<Request>) {
    let connected = tokio::select! {
        () = shared.cancel.cancelled() => return,
        result = shared.peripheral.connect() => result,
    };
    if let Err(e) = connected {
        tracing::warn!("connect to {} failed: {}", shared.address, e);
        shared.emit(GattEvent::ConnectionStateChanged {
            status: GattStatus::FAILURE,
            state: LinkLayerState::Disconnected,
        });
        return;
    }
    shared.emit(GattEvent::ConnectionStateChanged {
        status: GattStatus::SUCCESS,
        state: LinkLayerState::Connected,
    });

    let mut notifications = match shared.peripheral.notifications().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!("no notification stream for {}: {}", shared.address, e);
            None
        }
    };

    let mut linked = true;
    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => break,
            request = requests.recv() => {
                let Some(request) = request else { break };
                if !shared.execute(request).await {
                    linked = false;
                    break;
                }
            }
            Some(notification) = next_notification(&mut notifications) => {
                shared.notified(notification);
            }
        }
    }

    if linked {
        if let Err(e) = shared.peripheral.disconnect().await {
            tracing::debug!("disconnect from {} failed: {}", shared.address, e);
        }
    }
    tracing::debug!("session worker for {} stopped", shared.address);
}

/// One `btleplug` peripheral link.
struct BtleplugSession {
    shared: Arc<SessionShared>,
    requests: mpsc::UnboundedSender<Request>,
}

impl BtleplugSession {
    fn submit(&self, request: Request) -> std::result::Result<(), DispatchError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::new("session closed"));
        }
        self.requests
            .send(request)
            .map_err(|_| DispatchError::new("session worker stopped"))
    }

    fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> std::result::Result<Characteristic, DispatchError> {
        self.shared
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| DispatchError::new(format!("{characteristic} not discovered")))
    }
}

impl GattSession for BtleplugSession {
    fn discover_services(&self) -> std::result::Result<(), DispatchError> {
        self.submit(Request::Discover)
    }

    fn request_mtu(&self, _mtu: u16) -> std::result::Result<(), DispatchError> {
        Err(DispatchError::new("mtu exchange is left to the host stack"))
    }

    fn services(&self) -> Vec<GattService> {
        self.shared
            .peripheral
            .services()
            .into_iter()
            .map(convert_service)
            .collect()
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        kind: WriteKind,
    ) -> std::result::Result<(), DispatchError> {
        let characteristic = self.characteristic(service, characteristic)?;
        let acknowledged = !kind.is_unacknowledged();
        let kind = if acknowledged {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.submit(Request::Write {
            characteristic,
            value,
            kind,
            acknowledged,
        })
    }

    fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> std::result::Result<(), DispatchError> {
        let characteristic = self.characteristic(service, characteristic)?;
        self.submit(Request::Read { characteristic })
    }

    fn enable_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        _indicate: bool,
    ) -> std::result::Result<(), DispatchError> {
        // btleplug picks notify or indicate from the characteristic properties
        let characteristic = self.characteristic(service, characteristic)?;
        self.submit(Request::Subscribe {
            characteristic,
            descriptor,
        })
    }

    fn disconnect(&self) {
        self.shared.local_disconnect.store(true, Ordering::SeqCst);
        let _ = self.submit(Request::Disconnect);
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}
