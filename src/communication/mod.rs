//! GATT communication through a serialized operation queue.
//!
//! Every write, read and notification enable goes through one unbounded queue
//! drained by a single worker task, so at most one request/response exchange
//! is in flight per core. The worker dispatches to the native session,
//! registers a waiter in the [`PendingTable`](pending::PendingTable), and waits
//! for the callback the connector routes back through the [`Inbox`].

mod operation;
mod pending;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{CALLER_GRACE, CommunicateConfig, OPERATION_GRACE};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, Notification, ReadOutcome, WriteOutcome};
use crate::platform::{BleAdapter, DispatchError, GattEvent, GattSession, GattStatus, Permission};
use crate::store::CoreStore;
use crate::types::{
    CharacteristicTarget, DeviceAddress, GattCharacteristic, WriteKind, find_characteristic,
};

pub use operation::NotifyRequest;
use operation::{Completion, Operation, OperationKind, split_payload};
use pending::{PendingKey, PendingTable};

// ===== Inbox =====

struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

/// Receives data callbacks from the connector.
///
/// Solicited results complete waiters in the pending table; notifications go
/// to the broadcast channel, optionally rate limited per characteristic.
pub(crate) struct Inbox {
    pending: Arc<PendingTable>,
    events: EventDispatcher,
    throttles: Mutex<HashMap<PendingKey, Throttle>>,
}

fn status_result(status: GattStatus, value: Bytes) -> Result<Bytes> {
    if status.is_success() {
        Ok(value)
    } else {
        Err(Error::GattStatus { status })
    }
}

impl Inbox {
    fn new(events: EventDispatcher) -> Self {
        Self {
            pending: Arc::new(PendingTable::default()),
            events,
            throttles: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one data event. Link events are ignored here.
    pub(crate) fn route(&self, address: DeviceAddress, event: GattEvent) {
        match event {
            GattEvent::CharacteristicWrite {
                characteristic,
                status,
                ..
            } => {
                self.pending
                    .resolve((address, characteristic), status_result(status, Bytes::new()));
            }
            GattEvent::CharacteristicRead {
                characteristic,
                value,
                status,
                ..
            } => {
                self.pending
                    .resolve((address, characteristic), status_result(status, value));
            }
            GattEvent::DescriptorWrite {
                characteristic,
                status,
                ..
            } => {
                self.pending
                    .resolve((address, characteristic), status_result(status, Bytes::new()));
            }
            GattEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            } => {
                if self.throttled((address, characteristic)) {
                    tracing::trace!("throttled notification on {}/{}", address, characteristic);
                    return;
                }
                self.events.dispatch(Event::Notification(Notification {
                    address,
                    service,
                    characteristic,
                    value,
                }));
            }
            GattEvent::ConnectionStateChanged { .. }
            | GattEvent::ServicesDiscovered { .. }
            | GattEvent::MtuChanged { .. } => {}
        }
    }

    fn throttled(&self, key: PendingKey) -> bool {
        let mut throttles = self.throttles.lock();
        let Some(throttle) = throttles.get_mut(&key) else {
            return false;
        };
        let now = Instant::now();
        if throttle
            .last
            .is_some_and(|last| now.duration_since(last) < throttle.interval)
        {
            return true;
        }
        throttle.last = Some(now);
        false
    }

    fn set_interval(&self, key: PendingKey, interval: Option<Duration>) {
        let mut throttles = self.throttles.lock();
        match interval {
            Some(interval) if !interval.is_zero() => {
                throttles.insert(
                    key,
                    Throttle {
                        interval,
                        last: None,
                    },
                );
            }
            _ => {
                throttles.remove(&key);
            }
        }
    }

    /// Fails every in-flight exchange with `address`.
    pub(crate) fn fail_address(&self, address: DeviceAddress, error: &Error) {
        let count = self.pending.fail_address(address, error);
        if count > 0 {
            tracing::debug!("failed {} pending operations on {}: {}", count, address, error);
        }
    }

    /// Cancels every in-flight exchange.
    pub(crate) fn cancel_all(&self) {
        let count = self.pending.cancel_all();
        if count > 0 {
            tracing::debug!("cancelled {} pending operations", count);
        }
    }
}

// ===== Worker =====

struct Executor {
    core: Arc<CoreStore>,
    adapter: Arc<dyn BleAdapter>,
    inbox: Arc<Inbox>,
    config: CommunicateConfig,
}

impl Executor {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Operation>, cancel: CancellationToken) {
        tracing::debug!("operation worker started");
        loop {
            let op = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                op = queue.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            tracing::debug!("executing {} on {}", op.label(), op.target);
            self.process(op, &cancel).await;
        }

        queue.close();
        let mut drained = 0usize;
        while let Ok(op) = queue.try_recv() {
            op.fail(Error::Cancelled);
            drained += 1;
        }
        self.inbox.cancel_all();
        tracing::debug!("operation worker stopped, {} queued operations cancelled", drained);
    }

    async fn process(&self, op: Operation, cancel: &CancellationToken) {
        let Operation { target, kind } = op;
        match kind {
            OperationKind::Write {
                payload,
                kind,
                done,
            } => {
                let result = self
                    .bounded(cancel, self.write(&target, payload, kind))
                    .await;
                if let Err(e) = &result {
                    tracing::warn!("write to {} failed: {}", target, e);
                }
                self.inbox.events.dispatch(Event::Write(WriteOutcome {
                    target,
                    result: result.clone(),
                }));
                done.complete(result);
            }
            OperationKind::Read { done } => {
                let result = self.bounded(cancel, self.read(&target)).await;
                if let Err(e) = &result {
                    tracing::warn!("read from {} failed: {}", target, e);
                }
                self.inbox.events.dispatch(Event::Read(ReadOutcome {
                    target,
                    result: result.clone(),
                }));
                done.complete(result);
            }
            OperationKind::EnableNotify { request, done } => {
                let result = self
                    .bounded(cancel, self.enable_notify(&target, request))
                    .await;
                if let Err(e) = &result {
                    tracing::warn!("enabling notifications on {} failed: {}", target, e);
                }
                done.complete(result);
            }
        }
    }

    /// Bounds one operation by the communicate timeout plus the worker grace.
    async fn bounded<T>(
        &self,
        cancel: &CancellationToken,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let budget = self.config.timeout + OPERATION_GRACE;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(budget, operation) => {
                result.unwrap_or_else(|_| Err(Error::timeout(budget)))
            }
        }
    }

    fn permit(&self) -> Result<()> {
        if self.adapter.check_permission(Permission::Connect) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                permission: Permission::Connect,
            })
        }
    }

    /// Resolves the live session and characteristic for a target.
    fn resolve(
        &self,
        target: &CharacteristicTarget,
    ) -> Result<(Arc<dyn GattSession>, GattCharacteristic)> {
        self.permit()?;
        let session = self
            .core
            .session(target.address)
            .ok_or(Error::LinkNotFound {
                address: target.address,
            })?;
        let services = session.services();
        let characteristic = find_characteristic(&services, target.service, target.characteristic)
            .map_err(|service_missing| {
                if service_missing {
                    Error::ServiceNotFound {
                        service: target.service,
                    }
                } else {
                    Error::CharacteristicNotFound {
                        characteristic: target.characteristic,
                    }
                }
            })?
            .clone();
        Ok((session, characteristic))
    }

    /// Registers a waiter, dispatches, and waits for the matching callback.
    async fn exchange(
        &self,
        target: &CharacteristicTarget,
        dispatch: impl FnOnce() -> std::result::Result<(), DispatchError>,
    ) -> Result<Bytes> {
        let registration = self.inbox.pending.register(
            (target.address, target.characteristic),
            self.config.timeout,
        );
        if let Err(e) = dispatch() {
            tracing::warn!("dispatch to {} refused: {}", target, e);
            return Err(e.into());
        }
        registration.wait(self.config.timeout).await
    }

    async fn write(
        &self,
        target: &CharacteristicTarget,
        payload: Bytes,
        kind: WriteKind,
    ) -> Result<usize> {
        let (session, characteristic) = self.resolve(target)?;
        let kind = kind.resolve(characteristic.properties);
        let max = self.core.max_packet_size(target.address);
        let chunks = split_payload(&payload, max);
        let count = chunks.len();
        if count > 1 {
            tracing::debug!(
                "splitting {} bytes into {} packets of at most {}",
                payload.len(),
                count,
                max
            );
        }

        for (index, chunk) in chunks.into_iter().enumerate() {
            if index > 0 {
                self.permit()?;
            }
            tracing::trace!(
                "packet {}/{} ({} bytes) to {}",
                index + 1,
                count,
                chunk.len(),
                target
            );
            let (service, uuid) = (target.service, target.characteristic);
            if kind.is_unacknowledged() {
                session.write_characteristic(service, uuid, chunk, kind)?;
                tokio::time::sleep(self.config.no_response_pacing).await;
            } else {
                self.exchange(target, || {
                    session.write_characteristic(service, uuid, chunk, kind)
                })
                .await?;
            }
        }
        Ok(payload.len())
    }

    async fn read(&self, target: &CharacteristicTarget) -> Result<Bytes> {
        let (session, _) = self.resolve(target)?;
        self.exchange(target, || {
            session.read_characteristic(target.service, target.characteristic)
        })
        .await
    }

    async fn enable_notify(
        &self,
        target: &CharacteristicTarget,
        request: NotifyRequest,
    ) -> Result<()> {
        let (session, characteristic) = self.resolve(target)?;
        if !characteristic.has_descriptor(request.descriptor) {
            return Err(Error::DescriptorNotFound {
                characteristic: target.characteristic,
                descriptor: request.descriptor,
            });
        }
        self.exchange(target, || {
            session.enable_notification(
                target.service,
                target.characteristic,
                request.descriptor,
                request.indicate,
            )
        })
        .await?;
        tracing::info!(
            "{} enabled on {}",
            if request.indicate { "indications" } else { "notifications" },
            target
        );
        Ok(())
    }
}

// ===== Handler =====

/// Caller-facing side of the operation queue.
pub struct CommunicationHandler {
    queue: mpsc::UnboundedSender<Operation>,
    inbox: Arc<Inbox>,
    timeout: Duration,
}

impl CommunicationHandler {
    /// Creates the handler and spawns its worker.
    ///
    /// The worker stops when the core's cancellation token fires.
    #[must_use]
    pub fn new(
        core: Arc<CoreStore>,
        adapter: Arc<dyn BleAdapter>,
        config: CommunicateConfig,
        handle: &Handle,
    ) -> Self {
        let inbox = Arc::new(Inbox::new(core.events().clone()));
        let (queue, rx) = mpsc::unbounded_channel();
        let cancel = core.cancellation();
        let timeout = config.timeout;
        let executor = Executor {
            core,
            adapter,
            inbox: Arc::clone(&inbox),
            config,
        };
        handle.spawn(executor.run(rx, cancel));
        Self {
            queue,
            inbox,
            timeout,
        }
    }

    pub(crate) fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.inbox)
    }

    fn submit(&self, op: Operation) {
        if let Err(mpsc::error::SendError(op)) = self.queue.send(op) {
            tracing::debug!("queue closed, rejecting {} on {}", op.label(), op.target);
            op.fail(Error::Cancelled);
        }
    }

    async fn await_result<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let limit = self.timeout + CALLER_GRACE;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::timeout(limit)),
        }
    }

    // ===== Write =====

    /// Writes a payload, splitting it into MTU-sized packets.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns the first failing packet's error; later packets are not sent.
    pub async fn write(
        &self,
        target: CharacteristicTarget,
        payload: impl Into<Bytes>,
        kind: WriteKind,
    ) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.submit(Operation {
            target,
            kind: OperationKind::Write {
                payload: payload.into(),
                kind,
                done: Completion::Channel(tx),
            },
        });
        self.await_result(rx).await
    }

    /// Queues a write and reports the result through `callback`.
    pub fn write_with(
        &self,
        target: CharacteristicTarget,
        payload: impl Into<Bytes>,
        kind: WriteKind,
        callback: impl FnOnce(Result<usize>) + Send + 'static,
    ) {
        self.submit(Operation {
            target,
            kind: OperationKind::Write {
                payload: payload.into(),
                kind,
                done: Completion::Callback(Box::new(callback)),
            },
        });
    }

    // ===== Read =====

    /// Reads a characteristic value.
    ///
    /// # Errors
    ///
    /// Returns `GattStatus` if the peripheral reports a failure.
    pub async fn read(&self, target: CharacteristicTarget) -> Result<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.submit(Operation {
            target,
            kind: OperationKind::Read {
                done: Completion::Channel(tx),
            },
        });
        self.await_result(rx).await
    }

    /// Queues a read and reports the result through `callback`.
    pub fn read_with(
        &self,
        target: CharacteristicTarget,
        callback: impl FnOnce(Result<Bytes>) + Send + 'static,
    ) {
        self.submit(Operation {
            target,
            kind: OperationKind::Read {
                done: Completion::Callback(Box::new(callback)),
            },
        });
    }

    // ===== Notify =====

    /// Enables notifications or indications on a characteristic.
    ///
    /// # Errors
    ///
    /// Returns `DescriptorNotFound` if the characteristic lacks the descriptor.
    pub async fn enable_notification(
        &self,
        target: CharacteristicTarget,
        request: NotifyRequest,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(Operation {
            target,
            kind: OperationKind::EnableNotify {
                request,
                done: Completion::Channel(tx),
            },
        });
        self.await_result(rx).await
    }

    /// Queues a notification enable and reports the result through `callback`.
    pub fn enable_notification_with(
        &self,
        target: CharacteristicTarget,
        request: NotifyRequest,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.submit(Operation {
            target,
            kind: OperationKind::EnableNotify {
                request,
                done: Completion::Callback(Box::new(callback)),
            },
        });
    }

    /// Sets the minimum interval between notifications emitted for one
    /// characteristic. `None` or zero removes the limit.
    pub fn set_notification_interval(
        &self,
        address: DeviceAddress,
        characteristic: Uuid,
        interval: Option<Duration>,
    ) {
        self.inbox.set_interval((address, characteristic), interval);
    }
}

impl std::fmt::Debug for CommunicationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationHandler")
            .field("timeout", &self.timeout)
            .field("pending", &self.inbox.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;
    use crate::config::ConnectConfig;
    use crate::event::{EventFilter, EventKind};
    use crate::platform::mock::{MockAdapter, RX, Reply, SERVICE, TX, addr};
    use crate::platform::{GattCallbacks, GattEventSink};
    use crate::types::{ConnectionState, WriteKind};

    /// Stands in for the connector: forwards data events only.
    struct Forward(Arc<Inbox>);

    impl GattEventSink for Forward {
        fn on_gatt_event(&self, address: DeviceAddress, _generation: u64, event: GattEvent) {
            self.0.route(address, event);
        }
    }

    struct Harness {
        adapter: MockAdapter,
        core: Arc<CoreStore>,
        handler: CommunicationHandler,
        sink: Arc<Forward>,
    }

    impl Harness {
        fn new(config: CommunicateConfig) -> Self {
            let adapter = MockAdapter::new();
            let core = Arc::new(CoreStore::new(
                &ConnectConfig::default(),
                EventDispatcher::default(),
            ));
            let handler = CommunicationHandler::new(
                Arc::clone(&core),
                Arc::new(adapter.clone()),
                config,
                &Handle::current(),
            );
            let sink = Arc::new(Forward(handler.inbox()));
            Self {
                adapter,
                core,
                handler,
                sink,
            }
        }

        /// Opens a session for `address` and marks it ready with `mtu`.
        fn link(&self, address: DeviceAddress, mtu: u16) {
            self.core
                .publish(address, ConnectionState::Connecting { address });
            let generation = self.core.begin_session(address);
            let weak = Arc::downgrade(&self.sink);
            let sink: Weak<dyn GattEventSink> = weak;
            let session = self
                .adapter
                .open_session(&address, GattCallbacks::new(address, generation, sink))
                .unwrap();
            self.core.attach_session(address, generation, session);
            self.core.set_mtu(address, mtu);
        }
    }

    fn tx(address: DeviceAddress) -> CharacteristicTarget {
        CharacteristicTarget::new(address, SERVICE, TX)
    }

    fn rx(address: DeviceAddress) -> CharacteristicTarget {
        CharacteristicTarget::new(address, SERVICE, RX)
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunked_write_reassembles() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        let payload: Vec<u8> = (0..=99).collect();

        let written = h
            .handler
            .write(tx(addr(1)), payload.clone(), WriteKind::WithResponse)
            .await
            .unwrap();

        assert_eq!(written, 100);
        let packets = h.adapter.writes();
        assert_eq!(packets.len(), 100usize.div_ceil(20));
        let reassembled: Vec<u8> = packets.iter().flat_map(|p| p.value.to_vec()).collect();
        assert_eq!(reassembled, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_response_write_is_paced() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.adapter.set_write(Reply::Silent);
        let started = Instant::now();

        // Auto resolves to without-response on TX
        h.handler
            .write(tx(addr(1)), vec![0u8; 50], WriteKind::Auto)
            .await
            .unwrap();

        let packets = h.adapter.writes();
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.kind == WriteKind::WithoutResponse));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chunk_aborts_rest() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.adapter.set_write(Reply::Fail(GattStatus::FAILURE));

        let result = h
            .handler
            .write(tx(addr(1)), vec![1u8; 60], WriteKind::WithResponse)
            .await;

        assert_eq!(
            result,
            Err(Error::GattStatus {
                status: GattStatus::FAILURE
            })
        );
        assert_eq!(h.adapter.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_refusal() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.adapter.set_write(Reply::Reject);

        let result = h
            .handler
            .write(tx(addr(1)), &b"hi"[..], WriteKind::WithResponse)
            .await;
        assert!(matches!(result, Err(Error::DispatchFailed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_callback_has_no_effect() {
        let config = CommunicateConfig::default().timeout(Duration::from_millis(1000));
        let h = Harness::new(config);
        h.link(addr(1), 23);
        h.adapter.set_read(Reply::Silent, b"");
        let started = Instant::now();

        let result = h.handler.read(rx(addr(1))).await;

        assert_eq!(result, Err(Error::Timeout { timeout_ms: 1000 }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1000) + OPERATION_GRACE);
        assert_eq!(h.handler.inbox.pending.len(), 0);

        // the late answer finds no waiter and the next read is unaffected
        h.adapter
            .session(addr(1))
            .unwrap()
            .callbacks()
            .deliver(GattEvent::CharacteristicRead {
                service: SERVICE,
                characteristic: RX,
                value: Bytes::from_static(b"late"),
                status: GattStatus::SUCCESS,
            });
        h.adapter.set_read(Reply::Respond, b"fresh");
        assert_eq!(h.handler.read(rx(addr(1))).await.unwrap(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_across_addresses() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.link(addr(2), 23);
        let order = Arc::new(Mutex::new(Vec::new()));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for i in 0..6u8 {
            let address = if i % 2 == 0 { addr(1) } else { addr(2) };
            let order = Arc::clone(&order);
            let done_tx = done_tx.clone();
            let callback = move |result: Result<usize>| {
                assert!(result.is_ok());
                order.lock().push(i);
                let _ = done_tx.send(());
            };
            if i % 3 == 0 {
                h.handler
                    .write_with(tx(address), vec![i; 30], WriteKind::WithResponse, callback);
            } else {
                h.handler
                    .write_with(tx(address), vec![i; 5], WriteKind::WithoutResponse, callback);
            }
        }
        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_family() {
        let h = Harness::new(CommunicateConfig::default());

        let missing_link = h.handler.read(rx(addr(9))).await;
        assert_eq!(missing_link, Err(Error::LinkNotFound { address: addr(9) }));

        h.link(addr(1), 23);
        let bogus = Uuid::from_u128(0xdead);
        let no_service = h
            .handler
            .read(CharacteristicTarget::new(addr(1), bogus, RX))
            .await;
        assert_eq!(no_service, Err(Error::ServiceNotFound { service: bogus }));

        let no_char = h
            .handler
            .read(CharacteristicTarget::new(addr(1), SERVICE, bogus))
            .await;
        assert_eq!(
            no_char,
            Err(Error::CharacteristicNotFound {
                characteristic: bogus
            })
        );

        let no_descriptor = h
            .handler
            .enable_notification(tx(addr(1)), NotifyRequest::default())
            .await;
        assert!(matches!(no_descriptor, Err(Error::DescriptorNotFound { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.adapter.deny(Permission::Connect);

        let result = h.handler.read(rx(addr(1))).await;
        assert_eq!(
            result,
            Err(Error::PermissionDenied {
                permission: Permission::Connect
            })
        );
        assert!(h.adapter.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_results_and_gatt_failure() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        let mut results = h
            .core
            .events()
            .subscribe(Some(EventFilter::kind(EventKind::Read)));

        h.adapter.set_read(Reply::Respond, b"\x2a");
        assert_eq!(h.handler.read(rx(addr(1))).await.unwrap(), &b"\x2a"[..]);
        let Some(Event::Read(outcome)) = results.recv().await else {
            panic!("expected read outcome");
        };
        assert_eq!(outcome.target, rx(addr(1)));

        h.adapter.set_read(Reply::Fail(GattStatus::new(0x0d)), b"");
        assert_eq!(
            h.handler.read(rx(addr(1))).await,
            Err(Error::GattStatus {
                status: GattStatus::new(0x0d)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_and_throttle() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        let mut notifications = h
            .core
            .events()
            .subscribe(Some(EventFilter::kind(EventKind::Notification)));

        h.handler
            .enable_notification(rx(addr(1)), NotifyRequest::notifications())
            .await
            .unwrap();
        h.handler
            .set_notification_interval(addr(1), RX, Some(Duration::from_millis(100)));

        h.adapter.notify(addr(1), RX, b"a");
        h.adapter.notify(addr(1), RX, b"b");
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.adapter.notify(addr(1), RX, b"c");

        let first = notifications.recv().await.unwrap();
        let second = notifications.recv().await.unwrap();
        let values: Vec<Bytes> = [first, second]
            .into_iter()
            .map(|e| match e {
                Event::Notification(n) => n.value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![Bytes::from_static(b"a"), Bytes::from_static(b"c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_queue() {
        let h = Harness::new(CommunicateConfig::default());
        h.link(addr(1), 23);
        h.adapter.set_read(Reply::Silent, b"");

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        h.handler.read_with(rx(addr(1)), move |r| {
            let _ = first_tx.send(r);
        });
        h.handler.read_with(rx(addr(1)), move |r| {
            let _ = second_tx.send(r);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.core.release();

        assert_eq!(first_rx.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(second_rx.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(h.handler.read(rx(addr(1))).await, Err(Error::Cancelled));
    }
}
