//! Scriptable in-memory platform used by the unit tests.
//!
//! Callbacks are delivered from spawned tasks, never from inside the call that
//! triggered them, the way a real stack reports on its own thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    BleAdapter, DispatchError, GattCallbacks, GattEvent, GattSession, GattStatus, LinkLayerState,
    Permission, ScanCallbacks,
};
use crate::types::{
    CCCD_UUID, CharProperties, DeviceAddress, GattCharacteristic, GattService, WriteKind,
};

/// How the mock answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    /// Acknowledge with success.
    Respond,
    /// Accept the request and never call back.
    Silent,
    /// Call back with a failure status.
    Fail(GattStatus),
    /// Refuse synchronously.
    Reject,
}

/// One packet handed to `write_characteristic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WrittenPacket {
    pub address: DeviceAddress,
    pub characteristic: Uuid,
    pub value: Bytes,
    pub kind: WriteKind,
}

struct MockState {
    denied: HashSet<Permission>,
    unknown: HashSet<DeviceAddress>,
    unopenable: HashSet<DeviceAddress>,
    connect_failures: HashMap<DeviceAddress, VecDeque<GattStatus>>,
    services: Vec<GattService>,
    mtu: Reply,
    write: Reply,
    read: Reply,
    read_value: Bytes,
    notify: Reply,
    scan_refused: bool,
    scanning: Option<ScanCallbacks>,
    opens: Vec<DeviceAddress>,
    writes: Vec<WrittenPacket>,
    sessions: HashMap<DeviceAddress, Arc<MockSession>>,
}

/// In-memory [`BleAdapter`]. Clones share state.
#[derive(Clone)]
pub(crate) struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

pub(crate) const SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub(crate) const TX: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub(crate) const RX: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

pub(crate) fn addr(last: u8) -> DeviceAddress {
    DeviceAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last])
}

/// A UART-like service: `TX` accepts both write kinds, `RX` reads and notifies.
fn default_services() -> Vec<GattService> {
    vec![GattService {
        uuid: SERVICE,
        characteristics: vec![
            GattCharacteristic {
                uuid: TX,
                properties: CharProperties::WRITE | CharProperties::WRITE_WITHOUT_RESPONSE,
                descriptors: Vec::new(),
            },
            GattCharacteristic {
                uuid: RX,
                properties: CharProperties::READ | CharProperties::NOTIFY,
                descriptors: vec![CCCD_UUID],
            },
        ],
    }]
}

/// Routes crate logs to the test harness, filtered by `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl MockAdapter {
    pub(crate) fn new() -> Self {
        init_tracing();
        Self {
            state: Arc::new(Mutex::new(MockState {
                denied: HashSet::new(),
                unknown: HashSet::new(),
                unopenable: HashSet::new(),
                connect_failures: HashMap::new(),
                services: default_services(),
                mtu: Reply::Respond,
                write: Reply::Respond,
                read: Reply::Respond,
                read_value: Bytes::from_static(b"mock"),
                notify: Reply::Respond,
                scan_refused: false,
                scanning: None,
                opens: Vec::new(),
                writes: Vec::new(),
                sessions: HashMap::new(),
            })),
        }
    }

    pub(crate) fn deny(&self, permission: Permission) {
        self.state.lock().denied.insert(permission);
    }

    pub(crate) fn forget(&self, address: DeviceAddress) {
        self.state.lock().unknown.insert(address);
    }

    pub(crate) fn fail_open(&self, address: DeviceAddress) {
        self.state.lock().unopenable.insert(address);
    }

    /// The next hardware connect to `address` fails with `status`.
    pub(crate) fn queue_connect_failure(&self, address: DeviceAddress, status: GattStatus) {
        self.state
            .lock()
            .connect_failures
            .entry(address)
            .or_default()
            .push_back(status);
    }

    pub(crate) fn set_mtu(&self, reply: Reply) {
        self.state.lock().mtu = reply;
    }

    pub(crate) fn set_write(&self, reply: Reply) {
        self.state.lock().write = reply;
    }

    pub(crate) fn set_read(&self, reply: Reply, value: &'static [u8]) {
        let mut state = self.state.lock();
        state.read = reply;
        state.read_value = Bytes::from_static(value);
    }

    pub(crate) fn set_notify(&self, reply: Reply) {
        self.state.lock().notify = reply;
    }

    pub(crate) fn refuse_scan(&self) {
        self.state.lock().scan_refused = true;
    }

    pub(crate) fn opens(&self) -> Vec<DeviceAddress> {
        self.state.lock().opens.clone()
    }

    pub(crate) fn writes(&self) -> Vec<WrittenPacket> {
        self.state.lock().writes.clone()
    }

    pub(crate) fn is_scanning(&self) -> bool {
        self.state.lock().scanning.is_some()
    }

    /// Latest session opened for `address`.
    pub(crate) fn session(&self, address: DeviceAddress) -> Option<Arc<MockSession>> {
        self.state.lock().sessions.get(&address).cloned()
    }

    /// Reports one advertisement through the running scan.
    pub(crate) fn advertise(&self, address: DeviceAddress, name: Option<&str>, rssi: i16) {
        let callbacks = self.state.lock().scanning.clone();
        if let Some(callbacks) = callbacks {
            callbacks.on_result(address, name.map(str::to_owned), rssi);
        }
    }

    pub(crate) fn fail_scan(&self, code: i32) {
        let callbacks = self.state.lock().scanning.take();
        if let Some(callbacks) = callbacks {
            callbacks.on_failed(code);
        }
    }

    /// Drops the link as the remote side would.
    pub(crate) fn drop_link(&self, address: DeviceAddress, status: GattStatus) {
        if let Some(session) = self.session(address) {
            session.emit(GattEvent::ConnectionStateChanged {
                status,
                state: LinkLayerState::Disconnected,
            });
        }
    }

    /// Pushes a notification through the current session.
    pub(crate) fn notify(&self, address: DeviceAddress, characteristic: Uuid, value: &[u8]) {
        if let Some(session) = self.session(address) {
            session.emit(GattEvent::CharacteristicChanged {
                service: SERVICE,
                characteristic,
                value: Bytes::copy_from_slice(value),
            });
        }
    }
}

impl BleAdapter for MockAdapter {
    fn check_permission(&self, permission: Permission) -> bool {
        !self.state.lock().denied.contains(&permission)
    }

    fn has_device(&self, address: &DeviceAddress) -> bool {
        !self.state.lock().unknown.contains(address)
    }

    fn start_scan(&self, callbacks: ScanCallbacks) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        if state.scan_refused {
            return Err(DispatchError::new("scanner unavailable"));
        }
        state.scanning = Some(callbacks);
        Ok(())
    }

    fn stop_scan(&self) {
        self.state.lock().scanning = None;
    }

    fn open_session(
        &self,
        address: &DeviceAddress,
        callbacks: GattCallbacks,
    ) -> Option<Arc<dyn GattSession>> {
        let mut state = self.state.lock();
        state.opens.push(*address);
        if state.unopenable.contains(address) {
            return None;
        }
        let outcome = state
            .connect_failures
            .get_mut(address)
            .and_then(VecDeque::pop_front);
        let session = Arc::new(MockSession {
            address: *address,
            callbacks,
            adapter: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        });
        state.sessions.insert(*address, Arc::clone(&session));
        drop(state);

        let event = match outcome {
            Some(status) => GattEvent::ConnectionStateChanged {
                status,
                state: LinkLayerState::Disconnected,
            },
            None => GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkLayerState::Connected,
            },
        };
        session.emit(event);
        Some(session)
    }
}

/// In-memory [`GattSession`].
pub(crate) struct MockSession {
    address: DeviceAddress,
    callbacks: GattCallbacks,
    adapter: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

impl MockSession {
    /// Delivers an event asynchronously unless the session is closed by then.
    pub(crate) fn emit(self: &Arc<Self>, event: GattEvent) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            if !session.closed.load(Ordering::SeqCst) {
                session.callbacks.deliver(event);
            }
        });
    }

    /// The callback handle, for delivering events regardless of close.
    pub(crate) fn callbacks(&self) -> GattCallbacks {
        self.callbacks.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reply(
        self: &Arc<Self>,
        reply: Reply,
        event: impl FnOnce(GattStatus) -> GattEvent,
    ) -> Result<(), DispatchError> {
        match reply {
            Reply::Respond => self.emit(event(GattStatus::SUCCESS)),
            Reply::Fail(status) => self.emit(event(status)),
            Reply::Silent => {}
            Reply::Reject => return Err(DispatchError::new("request rejected")),
        }
        Ok(())
    }

    fn this(&self) -> Option<Arc<Self>> {
        self.adapter
            .lock()
            .sessions
            .get(&self.address)
            .filter(|s| std::ptr::eq(Arc::as_ptr(s), self))
            .cloned()
    }
}

impl GattSession for MockSession {
    fn discover_services(&self) -> Result<(), DispatchError> {
        let this = self.this().ok_or_else(|| DispatchError::new("stale session"))?;
        this.reply(Reply::Respond, |status| GattEvent::ServicesDiscovered { status })
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), DispatchError> {
        let this = self.this().ok_or_else(|| DispatchError::new("stale session"))?;
        let reply = self.adapter.lock().mtu;
        this.reply(reply, |status| GattEvent::MtuChanged { mtu, status })
    }

    fn services(&self) -> Vec<GattService> {
        self.adapter.lock().services.clone()
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Bytes,
        kind: WriteKind,
    ) -> Result<(), DispatchError> {
        let this = self.this().ok_or_else(|| DispatchError::new("stale session"))?;
        let reply = {
            let mut state = self.adapter.lock();
            if state.write == Reply::Reject {
                return Err(DispatchError::new("write rejected"));
            }
            state.writes.push(WrittenPacket {
                address: self.address,
                characteristic,
                value,
                kind,
            });
            state.write
        };
        if kind.is_unacknowledged() {
            return Ok(());
        }
        this.reply(reply, |status| GattEvent::CharacteristicWrite {
            service,
            characteristic,
            status,
        })
    }

    fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), DispatchError> {
        let this = self.this().ok_or_else(|| DispatchError::new("stale session"))?;
        let (reply, value) = {
            let state = self.adapter.lock();
            (state.read, state.read_value.clone())
        };
        this.reply(reply, |status| GattEvent::CharacteristicRead {
            service,
            characteristic,
            value: if status.is_success() { value } else { Bytes::new() },
            status,
        })
    }

    fn enable_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        _indicate: bool,
    ) -> Result<(), DispatchError> {
        let this = self.this().ok_or_else(|| DispatchError::new("stale session"))?;
        let reply = self.adapter.lock().notify;
        this.reply(reply, |status| GattEvent::DescriptorWrite {
            service,
            characteristic,
            descriptor,
            status,
        })
    }

    fn disconnect(&self) {
        if let Some(this) = self.this() {
            this.emit(GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                state: LinkLayerState::Disconnected,
            });
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
