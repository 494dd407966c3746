//! Core state store.
//!
//! Owns the per-address link table: connection state, native session handle,
//! negotiated MTU and session generation. Everything here is synchronous over
//! one `parking_lot` mutex that is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ConnectConfig, DEFAULT_MTU, max_packet_size};
use crate::event::{Event, EventDispatcher};
use crate::platform::{GattSession, GattStatus};
use crate::types::{ConnectionState, DeviceAddress, LinkEvent, StateKind};

/// Live view of one link's state.
///
/// Conflating: a slow reader sees the latest state, not every intermediate one.
/// Use the link events broadcast for a full transition log.
#[derive(Debug, Clone)]
pub struct StateStream {
    address: DeviceAddress,
    receiver: watch::Receiver<ConnectionState>,
}

impl StateStream {
    /// The device this stream follows.
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Returns the current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        self.receiver.borrow().clone()
    }

    /// Waits for the next state change.
    ///
    /// Returns `None` once the link is retired; [`current`](Self::current) then
    /// keeps reporting the final state.
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Waits until the state satisfies `predicate`, checking the current state first.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        self.receiver
            .wait_for(|s| predicate(s))
            .await
            .ok()
            .map(|s| s.clone())
    }

    /// Returns true if both streams observe the same link.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        self.receiver.same_channel(&other.receiver)
    }

    /// Converts into a stream of states, starting with the current one.
    pub fn into_stream(mut self) -> impl Stream<Item = ConnectionState> + Send + Unpin {
        self.receiver.mark_changed();
        Box::pin(futures::stream::unfold(self, |mut s| async move {
            s.changed().await.map(|state| (state, s))
        }))
    }
}

/// Result of an accepted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    /// Address pushed out in single-link mode.
    pub evicted: Option<DeviceAddress>,
}

/// Result of attaching a freshly opened session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attach {
    /// Stored. `discover` is set when the connected callback already arrived.
    Attached { discover: bool },
    /// The session belongs to a superseded attempt and was closed.
    Stale,
}

/// How a connection attempt claims its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectKind {
    /// Requested by the caller. An active link is reused; a single-link
    /// deployment hands the slot over instead of refusing.
    Fresh,
    /// Scheduled after an abnormal disconnect. Only starts from `Disconnected`.
    Reconnect,
}

/// Outcome of [`CoreStore::begin_connect`].
#[derive(Debug)]
pub(crate) enum ConnectStart {
    /// The address already holds a slot.
    Existing(StateStream),
    /// Every slot is taken.
    Limited,
    /// The link cannot start connecting from this state.
    Rejected(StateKind),
    /// `Connecting` was published.
    Started {
        stream: StateStream,
        transition: Transition,
    },
}

/// Side effects collected under the table lock, applied after it is released.
#[derive(Default)]
struct Effects {
    events: Vec<LinkEvent>,
    closing: Vec<Arc<dyn GattSession>>,
}

struct DeviceLink {
    state: watch::Sender<ConnectionState>,
    session: Option<Arc<dyn GattSession>>,
    entered_at: Instant,
    mtu: u16,
    generation: u64,
    discover_on_attach: bool,
}

impl DeviceLink {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(ConnectionState::Idle),
            session: None,
            entered_at: Instant::now(),
            mtu: DEFAULT_MTU,
            generation: 0,
            discover_on_attach: false,
        }
    }

    fn kind(&self) -> StateKind {
        self.state.borrow().kind()
    }

    /// Idle, sessionless and unobserved.
    fn is_unused(&self) -> bool {
        self.kind() == StateKind::Idle
            && self.session.is_none()
            && self.state.receiver_count() == 0
    }
}

#[derive(Default)]
struct Tables {
    links: HashMap<DeviceAddress, DeviceLink>,
    single_address: Option<DeviceAddress>,
    next_generation: u64,
}

/// Single source of truth for link state and session handles.
pub struct CoreStore {
    max_connections: usize,
    tables: Mutex<Tables>,
    events: EventDispatcher,
    cancel: CancellationToken,
}

fn shutdown(session: &Arc<dyn GattSession>) {
    session.disconnect();
    session.close();
}

impl Tables {
    fn kind(&self, address: DeviceAddress) -> StateKind {
        self.links.get(&address).map_or(StateKind::Idle, DeviceLink::kind)
    }

    fn active_count(&self) -> usize {
        self.links.values().filter(|l| l.kind().is_active()).count()
    }

    /// Subscribes to a link, dropping unused idle links of other addresses.
    fn subscribe(&mut self, address: DeviceAddress) -> StateStream {
        self.links.retain(|a, l| *a == address || !l.is_unused());
        let link = self.links.entry(address).or_insert_with(DeviceLink::new);
        StateStream {
            address,
            receiver: link.state.subscribe(),
        }
    }
}

impl CoreStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(config: &ConnectConfig, events: EventDispatcher) -> Self {
        Self {
            max_connections: config.max_connections,
            tables: Mutex::new(Tables::default()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// The dispatcher used for link events.
    #[must_use]
    pub const fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Token cancelled by [`release`](Self::release).
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    const fn is_single_link(&self) -> bool {
        self.max_connections == 1
    }

    // ===== States =====

    /// Returns the state stream for an address, creating an idle link if needed.
    ///
    /// Idle links nobody observes are dropped on the next call.
    pub fn state_stream(&self, address: DeviceAddress) -> StateStream {
        self.tables.lock().subscribe(address)
    }

    /// Returns the current state; `Idle` for unknown addresses.
    #[must_use]
    pub fn state(&self, address: DeviceAddress) -> ConnectionState {
        self.tables
            .lock()
            .links
            .get(&address)
            .map_or(ConnectionState::Idle, |l| l.state.borrow().clone())
    }

    /// Returns when the link entered its current state.
    #[must_use]
    pub fn entered_at(&self, address: DeviceAddress) -> Option<Instant> {
        self.tables.lock().links.get(&address).map(|l| l.entered_at)
    }

    /// Publishes a new state for an address.
    ///
    /// Returns false if the transition is not a legal edge.
    pub fn publish(&self, address: DeviceAddress, state: ConnectionState) -> bool {
        self.transition(address, state).is_some()
    }

    pub(crate) fn transition(
        &self,
        address: DeviceAddress,
        next: ConnectionState,
    ) -> Option<Transition> {
        let mut effects = Effects::default();
        let result = self.apply(&mut self.tables.lock(), address, next, &mut effects);
        self.flush(effects);
        result
    }

    /// Claims a slot and publishes `Connecting` under one table lock.
    pub(crate) fn begin_connect(&self, address: DeviceAddress, kind: ConnectKind) -> ConnectStart {
        let mut effects = Effects::default();
        let start = {
            let mut tables = self.tables.lock();
            let current = tables.kind(address);
            match kind {
                ConnectKind::Fresh if current.is_active() => {
                    return ConnectStart::Existing(tables.subscribe(address));
                }
                ConnectKind::Reconnect if current != StateKind::Disconnected => {
                    return ConnectStart::Rejected(current);
                }
                _ => {}
            }
            let hands_over = kind == ConnectKind::Fresh && self.is_single_link();
            if !hands_over && tables.active_count() >= self.max_connections {
                return ConnectStart::Limited;
            }

            let stream = tables.subscribe(address);
            let next = ConnectionState::Connecting { address };
            match self.apply(&mut tables, address, next, &mut effects) {
                Some(transition) => ConnectStart::Started { stream, transition },
                None => ConnectStart::Rejected(current),
            }
        };
        self.flush(effects);
        start
    }

    fn apply(
        &self,
        tables: &mut Tables,
        address: DeviceAddress,
        next: ConnectionState,
        effects: &mut Effects,
    ) -> Option<Transition> {
        let current = tables
            .links
            .get(&address)
            .map_or(ConnectionState::Idle, |l| l.state.borrow().clone());

        if !current.can_transition_to(&next) {
            tracing::warn!(
                "rejected transition for {}: {} -> {}",
                address,
                current.kind(),
                next.kind()
            );
            return None;
        }

        let mut evicted = None;
        if self.is_single_link() && next.kind() == StateKind::Connecting {
            if let Some(old) = tables.single_address.filter(|old| *old != address) {
                if let Some(mut link) = tables.links.remove(&old) {
                    tracing::warn!("single-link mode, evicting {}", old);
                    effects.closing.extend(link.session.take());
                    effects.events.extend(final_disconnect(old, &link));
                    evicted = Some(old);
                }
            }
            tables.single_address = Some(address);
        }

        let link = tables.links.entry(address).or_insert_with(DeviceLink::new);
        let elapsed = link.entered_at.elapsed();
        link.entered_at = Instant::now();
        link.state.send_replace(next.clone());
        tracing::debug!(
            "{}: {} -> {} after {:?}",
            address,
            current.kind(),
            next.kind(),
            elapsed
        );
        effects.events.push(LinkEvent {
            address,
            state: next,
        });
        Some(Transition { evicted })
    }

    fn flush(&self, effects: Effects) {
        for session in effects.closing {
            shutdown(&session);
        }
        for event in effects.events {
            self.events.dispatch(Event::Link(event));
        }
    }

    /// Returns true if connecting `address` would exceed the link cap.
    ///
    /// An address that is already active is never limited.
    #[must_use]
    pub fn is_connect_limited(&self, address: DeviceAddress) -> bool {
        let tables = self.tables.lock();
        !tables.kind(address).is_active() && tables.active_count() >= self.max_connections
    }

    /// Snapshot of every link that has left `Idle`.
    #[must_use]
    pub fn links(&self) -> Vec<(DeviceAddress, ConnectionState)> {
        let tables = self.tables.lock();
        let mut links: Vec<_> = tables
            .links
            .iter()
            .filter(|(_, l)| l.kind() != StateKind::Idle)
            .map(|(a, l)| (*a, l.state.borrow().clone()))
            .collect();
        links.sort_by_key(|(a, _)| *a);
        links
    }

    /// Current address in single-link mode, falling back to any non-idle link.
    #[must_use]
    pub fn single_address(&self) -> Option<DeviceAddress> {
        let tables = self.tables.lock();
        tables.single_address.or_else(|| {
            tables
                .links
                .iter()
                .filter(|(_, l)| l.kind() != StateKind::Idle)
                .map(|(a, _)| *a)
                .min()
        })
    }

    /// Removes a link whose disconnect is terminal.
    ///
    /// Links in any other state are kept; returns true if removed.
    pub fn retire(&self, address: DeviceAddress) -> bool {
        let removed = {
            let mut tables = self.tables.lock();
            let terminal = tables
                .links
                .get(&address)
                .is_some_and(|l| matches!(l.kind(), StateKind::Disconnected | StateKind::Idle));
            if !terminal {
                return false;
            }
            if tables.single_address == Some(address) {
                tables.single_address = None;
            }
            tables.links.remove(&address)
        };
        if let Some(session) = removed.and_then(|mut l| l.session.take()) {
            shutdown(&session);
        }
        tracing::debug!("retired link {}", address);
        true
    }

    // ===== Sessions =====

    /// Starts a new session attempt and returns its generation.
    ///
    /// Callbacks tagged with an older generation are ignored from here on.
    pub fn begin_session(&self, address: DeviceAddress) -> u64 {
        let mut tables = self.tables.lock();
        tables.next_generation += 1;
        let generation = tables.next_generation;
        let link = tables.links.entry(address).or_insert_with(DeviceLink::new);
        link.generation = generation;
        link.discover_on_attach = false;
        link.mtu = DEFAULT_MTU;
        generation
    }

    /// Returns true if `generation` is the live session attempt for the address.
    #[must_use]
    pub fn is_current(&self, address: DeviceAddress, generation: u64) -> bool {
        self.tables
            .lock()
            .links
            .get(&address)
            .is_some_and(|l| l.generation == generation)
    }

    /// Stores a session handle, force-closing any prior one.
    pub(crate) fn attach_session(
        &self,
        address: DeviceAddress,
        generation: u64,
        session: Arc<dyn GattSession>,
    ) -> Attach {
        let (prior, attach) = {
            let mut tables = self.tables.lock();
            match tables.links.get_mut(&address) {
                Some(link) if link.generation == generation => {
                    let prior = link.session.replace(session);
                    let discover = std::mem::take(&mut link.discover_on_attach);
                    (prior, Attach::Attached { discover })
                }
                _ => (Some(session), Attach::Stale),
            }
        };
        if let Some(prior) = prior {
            shutdown(&prior);
        }
        attach
    }

    /// Returns the live session for an address.
    #[must_use]
    pub fn session(&self, address: DeviceAddress) -> Option<Arc<dyn GattSession>> {
        self.tables
            .lock()
            .links
            .get(&address)
            .and_then(|l| l.session.clone())
    }

    /// Returns the session to run discovery on, or marks discovery as owed
    /// once the session is attached.
    pub(crate) fn session_for_discovery(
        &self,
        address: DeviceAddress,
        generation: u64,
    ) -> Option<Arc<dyn GattSession>> {
        let mut tables = self.tables.lock();
        let link = tables
            .links
            .get_mut(&address)
            .filter(|l| l.generation == generation)?;
        if link.session.is_none() {
            link.discover_on_attach = true;
        }
        link.session.clone()
    }

    /// Force-closes the session for an address. Returns true if one existed.
    pub fn close_session(&self, address: DeviceAddress) -> bool {
        let session = self
            .tables
            .lock()
            .links
            .get_mut(&address)
            .and_then(|l| l.session.take());
        session.is_some_and(|s| {
            shutdown(&s);
            true
        })
    }

    // ===== MTU =====

    pub fn set_mtu(&self, address: DeviceAddress, mtu: u16) {
        if let Some(link) = self.tables.lock().links.get_mut(&address) {
            link.mtu = mtu;
        }
    }

    /// Negotiated MTU for the address, or the BLE default.
    #[must_use]
    pub fn mtu(&self, address: DeviceAddress) -> u16 {
        self.tables
            .lock()
            .links
            .get(&address)
            .map_or(DEFAULT_MTU, |l| l.mtu)
    }

    /// Usable payload per packet for the address.
    #[must_use]
    pub fn max_packet_size(&self, address: DeviceAddress) -> usize {
        max_packet_size(self.mtu(address))
    }

    // ===== Lifecycle =====

    /// Cancels background work, force-closes all sessions and clears all tables.
    ///
    /// Live links publish a final `Disconnected` with a success status first.
    pub fn release(&self) {
        self.cancel.cancel();
        let mut effects = Effects::default();
        let count = {
            let mut tables = self.tables.lock();
            tables.single_address = None;
            let links = std::mem::take(&mut tables.links);
            let count = links.len();
            for (address, mut link) in links {
                effects.closing.extend(link.session.take());
                effects.events.extend(final_disconnect(address, &link));
            }
            count
        };
        self.flush(effects);
        tracing::info!("core released, {} links dropped", count);
    }
}

/// Moves a live link to `Disconnected` with a success status.
fn final_disconnect(address: DeviceAddress, link: &DeviceLink) -> Option<LinkEvent> {
    let from = link.kind();
    if matches!(from, StateKind::Idle | StateKind::Disconnected) {
        return None;
    }
    let state = ConnectionState::Disconnected {
        address,
        from,
        status: GattStatus::SUCCESS,
    };
    link.state.send_replace(state.clone());
    Some(LinkEvent { address, state })
}

impl std::fmt::Debug for CoreStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreStore")
            .field("max_connections", &self.max_connections)
            .field("links", &self.tables.lock().links.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventFilter, EventKind};
    use crate::platform::DispatchError;
    use crate::types::{GattService, WriteKind};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn addr(last: u8) -> DeviceAddress {
        DeviceAddress::new([0xAA, 0, 0, 0, 0, last])
    }

    fn store(max: usize) -> CoreStore {
        crate::platform::mock::init_tracing();
        CoreStore::new(
            &ConnectConfig::default().max_connections(max),
            EventDispatcher::default(),
        )
    }

    #[derive(Default)]
    struct CountingSession {
        closes: AtomicUsize,
    }

    impl GattSession for CountingSession {
        fn discover_services(&self) -> Result<(), DispatchError> {
            Ok(())
        }
        fn request_mtu(&self, _mtu: u16) -> Result<(), DispatchError> {
            Ok(())
        }
        fn services(&self) -> Vec<GattService> {
            Vec::new()
        }
        fn write_characteristic(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
            _value: Bytes,
            _kind: WriteKind,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
        fn read_characteristic(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
        fn enable_notification(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
            _descriptor: Uuid,
            _indicate: bool,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
        fn disconnect(&self) {}
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connecting(store: &CoreStore, address: DeviceAddress) {
        assert!(store.publish(address, ConnectionState::Connecting { address }));
    }

    #[test]
    fn test_state_stream_get_or_create() {
        let store = store(3);
        let a = store.state_stream(addr(1));
        let b = store.state_stream(addr(1));
        assert!(a.same_channel(&b));
        assert_eq!(a.current(), ConnectionState::Idle);
        // observing an address does not make it a link
        assert!(store.links().is_empty());
        assert_eq!(store.single_address(), None);
    }

    #[test]
    fn test_unobserved_idle_links_are_dropped() {
        let store = store(3);
        drop(store.state_stream(addr(1)));
        let kept = store.state_stream(addr(2));
        let _third = store.state_stream(addr(3));

        let tables = store.tables.lock();
        assert!(!tables.links.contains_key(&addr(1)));
        assert!(tables.links.contains_key(&addr(2)));
        drop(tables);

        // a stream taken before connecting still follows the link
        connecting(&store, addr(2));
        assert_eq!(kept.current(), ConnectionState::Connecting { address: addr(2) });
    }

    #[test]
    fn test_begin_connect() {
        let store = store(1);
        let ConnectStart::Started { stream, transition } =
            store.begin_connect(addr(1), ConnectKind::Fresh)
        else {
            panic!("connect not started");
        };
        assert_eq!(transition.evicted, None);

        let ConnectStart::Existing(again) = store.begin_connect(addr(1), ConnectKind::Fresh) else {
            panic!("active link not reused");
        };
        assert!(stream.same_channel(&again));

        // reconnects never hand over the single slot
        assert!(matches!(
            store.begin_connect(addr(2), ConnectKind::Reconnect),
            ConnectStart::Rejected(StateKind::Idle)
        ));
        assert!(matches!(
            store.begin_connect(addr(2), ConnectKind::Fresh),
            ConnectStart::Started { transition: Transition { evicted: Some(_) }, .. }
        ));
    }

    #[test]
    fn test_begin_connect_limit() {
        let store = store(2);
        for last in 1..=2 {
            assert!(matches!(
                store.begin_connect(addr(last), ConnectKind::Fresh),
                ConnectStart::Started { .. }
            ));
        }
        assert!(matches!(
            store.begin_connect(addr(3), ConnectKind::Fresh),
            ConnectStart::Limited
        ));
        assert_eq!(store.links().len(), 2);
    }

    #[test]
    fn test_publish_rejects_illegal_edge() {
        let store = store(3);
        let address = addr(1);
        assert!(!store.publish(address, ConnectionState::Connected { address }));
        connecting(&store, address);
        assert!(!store.publish(address, ConnectionState::Connecting { address }));
        assert_eq!(store.state(address), ConnectionState::Connecting { address });
    }

    #[test]
    fn test_connect_limit() {
        let store = store(2);
        connecting(&store, addr(1));
        assert!(!store.is_connect_limited(addr(2)));
        connecting(&store, addr(2));
        assert!(store.is_connect_limited(addr(3)));
        // already active addresses are never limited
        assert!(!store.is_connect_limited(addr(1)));
    }

    #[test]
    fn test_disconnecting_frees_slot() {
        let store = store(1);
        let address = addr(1);
        connecting(&store, address);
        assert!(store.is_connect_limited(addr(2)));
        store.publish(address, ConnectionState::Disconnecting { address });
        assert!(!store.is_connect_limited(addr(2)));
    }

    #[test]
    fn test_attach_replaces_and_closes_prior() {
        let store = store(3);
        let address = addr(1);
        connecting(&store, address);
        let generation = store.begin_session(address);

        let first = Arc::new(CountingSession::default());
        let second = Arc::new(CountingSession::default());
        store.attach_session(address, generation, first.clone());
        store.attach_session(address, generation, second.clone());

        assert_eq!(first.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second.closes.load(Ordering::SeqCst), 0);
        assert!(store.close_session(address));
        assert_eq!(second.closes.load(Ordering::SeqCst), 1);
        assert!(!store.close_session(address));
    }

    #[test]
    fn test_stale_attach_is_closed() {
        let store = store(3);
        let address = addr(1);
        let old = store.begin_session(address);
        let _new = store.begin_session(address);
        let session = Arc::new(CountingSession::default());

        assert_eq!(
            store.attach_session(address, old, session.clone()),
            Attach::Stale
        );
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(store.session(address).is_none());
    }

    #[test]
    fn test_discovery_owed_until_attach() {
        let store = store(3);
        let address = addr(1);
        let generation = store.begin_session(address);

        assert!(store.session_for_discovery(address, generation).is_none());
        let attach = store.attach_session(address, generation, Arc::new(CountingSession::default()));
        assert_eq!(attach, Attach::Attached { discover: true });
    }

    #[tokio::test]
    async fn test_single_link_eviction() {
        let store = store(1);
        let mut events = store
            .events()
            .subscribe(Some(EventFilter::kind(EventKind::Link)));
        let old = addr(1);
        let new = addr(2);
        connecting(&store, old);
        let generation = store.begin_session(old);
        let session = Arc::new(CountingSession::default());
        store.attach_session(old, generation, session.clone());
        let old_stream = store.state_stream(old);

        // a dead link no longer occupies the slot, but is still tracked
        store.publish(
            old,
            ConnectionState::Disconnected {
                address: old,
                from: StateKind::Connecting,
                status: GattStatus::CONNECTION_TIMEOUT,
            },
        );
        let transition = store
            .transition(new, ConnectionState::Connecting { address: new })
            .unwrap();

        assert_eq!(transition.evicted, Some(old));
        assert_eq!(session.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            old_stream.current(),
            ConnectionState::Disconnected { .. }
        ));
        assert_eq!(store.links().len(), 1);
        assert_eq!(store.single_address(), Some(new));

        let mut seen = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(10), events.recv()).await
        {
            seen.push(event.address());
        }
        assert_eq!(seen, vec![old, old, new]);
    }

    #[test]
    fn test_retire_only_terminal() {
        let store = store(3);
        let address = addr(1);
        connecting(&store, address);
        assert!(!store.retire(address));
        store.publish(
            address,
            ConnectionState::Disconnected {
                address,
                from: StateKind::Connecting,
                status: GattStatus::SESSION_FAILED,
            },
        );
        assert!(store.retire(address));
        assert_eq!(store.state(address), ConnectionState::Idle);
    }

    #[test]
    fn test_release_closes_everything() {
        let store = store(3);
        let session = Arc::new(CountingSession::default());
        for last in 1..=2 {
            let address = addr(last);
            connecting(&store, address);
            let generation = store.begin_session(address);
            store.attach_session(address, generation, session.clone());
        }
        let token = store.cancellation();
        let stream = store.state_stream(addr(1));

        store.release();

        assert!(token.is_cancelled());
        assert!(store.is_released());
        assert_eq!(session.closes.load(Ordering::SeqCst), 2);
        assert!(store.links().is_empty());
        assert_eq!(
            stream.current(),
            ConnectionState::Disconnected {
                address: addr(1),
                from: StateKind::Connecting,
                status: GattStatus::SUCCESS,
            }
        );
    }

    #[test]
    fn test_mtu_defaults() {
        let store = store(3);
        let address = addr(1);
        assert_eq!(store.max_packet_size(address), 20);
        store.begin_session(address);
        store.set_mtu(address, 247);
        assert_eq!(store.max_packet_size(address), 244);
    }

    #[tokio::test]
    async fn test_stream_sees_changes() {
        let store = store(3);
        let address = addr(1);
        let mut stream = store.state_stream(address);
        connecting(&store, address);
        let state = stream.changed().await.unwrap();
        assert_eq!(state, ConnectionState::Connecting { address });
    }
}
