//! Connection state machine and bounded reconnection.
//!
//! The connector opens native sessions and translates their callbacks into
//! [`ConnectionState`] transitions:
//!
//! ```text
//! Idle -> Connecting -> Connected -> DiscoveringServices -> NegotiatingMtu -> Ready
//!                                                   \_______________________/
//! any active state -> Disconnecting -> Disconnected
//! any active state -> Disconnected -> Connecting (reconnect)
//! ```
//!
//! Data callbacks are handed to the communication inbox untouched.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::communication::Inbox;
use crate::config::{DEFAULT_MTU, ReconnectConfig};
use crate::error::{Error, Result};
use crate::platform::{
    BleAdapter, GattCallbacks, GattEvent, GattEventSink, GattSession, GattStatus, LinkLayerState,
    Permission,
};
use crate::store::{Attach, ConnectKind, ConnectStart, CoreStore, StateStream, Transition};
use crate::types::{ConnectionState, DeviceAddress, GattService, StateKind};

struct ConnectorShared {
    core: Arc<CoreStore>,
    adapter: Arc<dyn BleAdapter>,
    inbox: Arc<Inbox>,
    reconnect: ReconnectConfig,
    max_connections: usize,
    target_mtu: u16,
    handle: Handle,
    /// Serializes reconnection attempts across all addresses.
    reconnect_lock: Arc<tokio::sync::Mutex<()>>,
    retries: Mutex<HashMap<DeviceAddress, u32>>,
    weak: Weak<ConnectorShared>,
}

/// Drives device links through their lifecycle.
pub struct Connector {
    shared: Arc<ConnectorShared>,
}

/// Connector settings taken from the device configuration.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub reconnect: ReconnectConfig,
    pub max_connections: usize,
    /// MTU requested once services are discovered.
    pub target_mtu: u16,
}

impl Connector {
    /// Creates a connector.
    #[must_use]
    pub(crate) fn new(
        core: Arc<CoreStore>,
        adapter: Arc<dyn BleAdapter>,
        inbox: Arc<Inbox>,
        options: ConnectorOptions,
        handle: Handle,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak| ConnectorShared {
            core,
            adapter,
            inbox,
            reconnect: options.reconnect,
            max_connections: options.max_connections,
            target_mtu: options.target_mtu,
            handle,
            reconnect_lock: Arc::new(tokio::sync::Mutex::new(())),
            retries: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        });
        Self { shared }
    }

    /// Connects to a device.
    ///
    /// Connecting an address that is already active returns its existing
    /// stream without opening another session.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` without the connect permission
    /// - `DeviceNotFound` if the adapter cannot resolve the address
    /// - `ConnectLimitExceeded` if all link slots are taken, unless the
    ///   deployment allows a single link, which is then handed over
    /// - `DispatchFailed` if no native session could be opened
    pub fn connect(&self, address: DeviceAddress) -> Result<StateStream> {
        let shared = &self.shared;
        if !shared.adapter.check_permission(Permission::Connect) {
            return Err(Error::PermissionDenied {
                permission: Permission::Connect,
            });
        }
        if !shared.adapter.has_device(&address) {
            return Err(Error::DeviceNotFound { address });
        }
        match shared.core.begin_connect(address, ConnectKind::Fresh) {
            ConnectStart::Existing(stream) => {
                tracing::debug!("{} already active, reusing link", address);
                Ok(stream)
            }
            ConnectStart::Limited => Err(Error::ConnectLimitExceeded {
                max: shared.max_connections,
            }),
            ConnectStart::Rejected(kind) => Err(Error::DispatchFailed {
                reason: format!("{address} is {kind}"),
            }),
            ConnectStart::Started { stream, transition } => {
                shared.retries.lock().remove(&address);
                tracing::info!("connecting to {}", address);
                shared.open(address, transition)?;
                Ok(stream)
            }
        }
    }

    /// Disconnects a device on request. Never triggers reconnection.
    ///
    /// Returns false if the address had no link.
    pub fn disconnect(&self, address: DeviceAddress) -> bool {
        self.shared.disconnect(address)
    }

    /// Reconnection attempts made since the link was last ready.
    #[must_use]
    pub fn retry_count(&self, address: DeviceAddress) -> u32 {
        self.shared
            .retries
            .lock()
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Forgets all retry bookkeeping. Tasks stop with the core's token.
    pub fn release(&self) {
        self.shared.retries.lock().clear();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("reconnect", &self.shared.reconnect)
            .field("target_mtu", &self.shared.target_mtu)
            .finish_non_exhaustive()
    }
}

impl ConnectorShared {
    /// Opens a native session for a link that just entered `Connecting`.
    fn open(&self, address: DeviceAddress, transition: Transition) -> Result<()> {
        if let Some(evicted) = transition.evicted {
            self.retries.lock().remove(&evicted);
            self.inbox.fail_address(evicted, &Error::Cancelled);
        }

        let generation = self.core.begin_session(address);
        let sink: Weak<dyn GattEventSink> = self.weak.clone();
        let callbacks = GattCallbacks::new(address, generation, sink);

        let Some(session) = self.adapter.open_session(&address, callbacks) else {
            tracing::warn!("could not open a session to {}", address);
            self.core.publish(
                address,
                ConnectionState::Disconnected {
                    address,
                    from: StateKind::Connecting,
                    status: GattStatus::SESSION_FAILED,
                },
            );
            self.retries.lock().remove(&address);
            self.core.retire(address);
            return Err(Error::DispatchFailed {
                reason: format!("could not open a session to {address}"),
            });
        };

        match self.core.attach_session(address, generation, session) {
            Attach::Attached { discover: true } => {
                if let Some(session) = self.core.session(address) {
                    self.discover(address, &session);
                }
            }
            Attach::Attached { discover: false } => {}
            Attach::Stale => tracing::debug!("session to {} superseded while opening", address),
        }
        Ok(())
    }

    fn discover(&self, address: DeviceAddress, session: &Arc<dyn GattSession>) {
        if !self
            .core
            .publish(address, ConnectionState::DiscoveringServices { address })
        {
            return;
        }
        if let Err(e) = session.discover_services() {
            tracing::warn!("service discovery on {} refused: {}", address, e);
            self.link_lost(address, GattStatus::FAILURE);
        }
    }

    fn services_discovered(&self, address: DeviceAddress) {
        let Some(session) = self.core.session(address) else {
            return;
        };
        let services = session.services();
        tracing::debug!("{} exposes {} services", address, services.len());

        if self.target_mtu <= DEFAULT_MTU {
            self.ready(address, DEFAULT_MTU, services);
            return;
        }
        let requested_mtu = self.target_mtu;
        if !self.core.publish(
            address,
            ConnectionState::NegotiatingMtu {
                address,
                requested_mtu,
            },
        ) {
            return;
        }
        if let Err(e) = session.request_mtu(requested_mtu) {
            tracing::warn!("mtu request on {} refused, keeping default: {}", address, e);
            self.ready(address, DEFAULT_MTU, services);
        }
    }

    fn mtu_changed(&self, address: DeviceAddress, mtu: u16, status: GattStatus) {
        let negotiating = self.core.state(address).kind() == StateKind::NegotiatingMtu;
        if !negotiating {
            if status.is_success() {
                self.core.set_mtu(address, mtu);
            }
            return;
        }
        let mtu = if status.is_success() {
            mtu
        } else {
            tracing::warn!("mtu exchange on {} failed: {}", address, status);
            DEFAULT_MTU
        };
        let services = self
            .core
            .session(address)
            .map(|s| s.services())
            .unwrap_or_default();
        self.ready(address, mtu, services);
    }

    fn ready(&self, address: DeviceAddress, mtu: u16, services: Vec<GattService>) {
        self.core.set_mtu(address, mtu);
        let ready = ConnectionState::Ready {
            address,
            mtu,
            services: services.into(),
        };
        if self.core.publish(address, ready) {
            self.retries.lock().remove(&address);
            tracing::info!("{} ready, mtu {}", address, mtu);
        }
    }

    /// Handles a link that went down without being asked to.
    fn link_lost(&self, address: DeviceAddress, status: GattStatus) {
        let from = self.core.state(address).kind();
        if matches!(
            from,
            StateKind::Idle | StateKind::Disconnected | StateKind::Disconnecting
        ) {
            return;
        }
        self.core.close_session(address);
        self.core.publish(
            address,
            ConnectionState::Disconnected {
                address,
                from,
                status,
            },
        );

        if status.is_success() {
            tracing::info!("{} disconnected", address);
            self.inbox.fail_address(address, &Error::Cancelled);
            self.retries.lock().remove(&address);
            self.core.retire(address);
            return;
        }

        tracing::warn!("{} lost from {}: {}", address, from, status);
        self.inbox
            .fail_address(address, &Error::AbnormalDisconnect { status });
        if self.reconnect.enabled {
            self.schedule_reconnect(address);
        } else {
            self.core.retire(address);
        }
    }

    fn schedule_reconnect(&self, address: DeviceAddress) {
        let attempt = {
            let mut retries = self.retries.lock();
            let count = retries.entry(address).or_insert(0);
            if *count >= self.reconnect.max_retries {
                None
            } else {
                *count += 1;
                Some(*count)
            }
        };
        let Some(attempt) = attempt else {
            tracing::warn!(
                "giving up on {} after {} reconnect attempts",
                address,
                self.reconnect.max_retries
            );
            self.retries.lock().remove(&address);
            self.core.retire(address);
            return;
        };

        let weak = self.weak.clone();
        let lock = Arc::clone(&self.reconnect_lock);
        let cancel = self.core.cancellation();
        let delay = self.reconnect.delay;
        self.handle.spawn(async move {
            let _guard = tokio::select! {
                () = cancel.cancelled() => return,
                guard = lock.lock_owned() => guard,
            };
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if let Some(shared) = weak.upgrade() {
                shared.attempt_reconnect(address, attempt);
            }
        });
    }

    fn attempt_reconnect(&self, address: DeviceAddress, attempt: u32) {
        match self.core.begin_connect(address, ConnectKind::Reconnect) {
            ConnectStart::Started { transition, .. } => {
                tracing::info!(
                    "reconnecting to {} (attempt {}/{})",
                    address,
                    attempt,
                    self.reconnect.max_retries
                );
                if let Err(e) = self.open(address, transition) {
                    tracing::warn!("reconnect to {} failed: {}", address, e);
                }
            }
            ConnectStart::Limited => {
                tracing::warn!("reconnect to {} abandoned, no free link slot", address);
                self.retries.lock().remove(&address);
                self.core.retire(address);
            }
            ConnectStart::Rejected(kind) => {
                tracing::debug!("reconnect to {} abandoned, link is {}", address, kind);
            }
            ConnectStart::Existing(_) => {}
        }
    }

    fn disconnect(&self, address: DeviceAddress) -> bool {
        self.retries.lock().remove(&address);
        let state = self.core.state(address);
        let from = state.kind();
        match from {
            StateKind::Idle => return false,
            StateKind::Disconnecting => return true,
            StateKind::Disconnected => {
                // pending reconnect
                self.core.close_session(address);
                self.core.retire(address);
                return true;
            }
            _ => {}
        }

        self.core
            .publish(address, ConnectionState::Disconnecting { address });
        self.core.close_session(address);
        self.core.publish(
            address,
            ConnectionState::Disconnected {
                address,
                from,
                status: GattStatus::SUCCESS,
            },
        );
        self.inbox.fail_address(address, &Error::Cancelled);
        self.core.retire(address);
        tracing::info!("disconnected from {}", address);
        true
    }
}

impl GattEventSink for ConnectorShared {
    fn on_gatt_event(&self, address: DeviceAddress, generation: u64, event: GattEvent) {
        if !self.core.is_current(address, generation) {
            tracing::trace!("ignoring stale callback for {}: {:?}", address, event);
            return;
        }

        match event {
            GattEvent::ConnectionStateChanged { status, state } => match state {
                LinkLayerState::Connected if status.is_success() => {
                    if !self
                        .core
                        .publish(address, ConnectionState::Connected { address })
                    {
                        return;
                    }
                    if let Some(session) = self.core.session_for_discovery(address, generation) {
                        self.discover(address, &session);
                    }
                }
                LinkLayerState::Connected | LinkLayerState::Disconnected => {
                    self.link_lost(address, status);
                }
                LinkLayerState::Connecting | LinkLayerState::Disconnecting => {
                    tracing::trace!("{} link layer {:?}", address, state);
                }
            },
            GattEvent::ServicesDiscovered { status } => {
                if status.is_success() {
                    self.services_discovered(address);
                } else {
                    tracing::warn!("service discovery on {} failed: {}", address, status);
                    self.link_lost(address, status);
                }
            }
            GattEvent::MtuChanged { mtu, status } => self.mtu_changed(address, mtu, status),
            data => self.inbox.route(address, data),
        }
    }
}
