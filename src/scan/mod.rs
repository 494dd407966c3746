//! Device discovery.
//!
//! Raw reports from the native scanner land in a bounded buffer. A consumer
//! task folds them into a working set keyed by address, and an emitter task
//! publishes a filtered, aged and sorted snapshot on a fixed interval. Manual
//! stop, timeout and native failure share one teardown path that emits exactly
//! one [`ScanEvent::Finished`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::{Error, Result};
use crate::platform::{BleAdapter, Permission, ScanCallbacks, ScanFailureSink};
use crate::types::{DeviceAddress, FinishReason, ScanEvent, ScanFilter, ScanResult};

const EVENT_CAPACITY: usize = 16;

type WorkingSet = Arc<Mutex<HashMap<DeviceAddress, ScanResult>>>;

/// A subscription to scan events.
pub struct ScanSubscription {
    receiver: broadcast::Receiver<ScanEvent>,
}

impl ScanSubscription {
    /// Receives the next scan event.
    ///
    /// Returns `None` after the scan has finished and every event was read.
    pub async fn recv(&mut self) -> Option<ScanEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Converts the subscription into a stream ending after [`ScanEvent::Finished`].
    pub fn into_stream(self) -> impl Stream<Item = ScanEvent> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        }))
    }
}

struct ActiveScan {
    session: u64,
    events: broadcast::Sender<ScanEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ScanState {
    active: Option<ActiveScan>,
    next_session: u64,
}

struct ScanShared {
    adapter: Arc<dyn BleAdapter>,
    state: Mutex<ScanState>,
}

impl ScanShared {
    fn finish(&self, session: Option<u64>, reason: FinishReason) -> bool {
        let active = {
            let mut state = self.state.lock();
            match (&state.active, session) {
                (Some(active), Some(s)) if active.session != s => return false,
                (None, _) => return false,
                _ => {}
            }
            state.active.take()
        };
        let Some(active) = active else {
            return false;
        };

        self.adapter.stop_scan();
        active.cancel.cancel();
        match reason {
            FinishReason::Failed { code } => {
                tracing::warn!("scan {} failed with code {}", active.session, code);
            }
            _ => tracing::info!("scan {} finished: {:?}", active.session, reason),
        }
        let _ = active.events.send(ScanEvent::Finished { reason });
        true
    }

    /// Sends a snapshot while `session` is still the running scan.
    ///
    /// Holds the state lock across the send, so once `finish` has taken the
    /// session no snapshot can follow its `Finished`.
    fn emit(&self, session: u64, event: ScanEvent) -> bool {
        let state = self.state.lock();
        let Some(active) = state.active.as_ref().filter(|a| a.session == session) else {
            return false;
        };
        if active.events.send(event).is_err() {
            tracing::trace!("no scan subscribers");
        }
        true
    }
}

impl ScanFailureSink for ScanShared {
    fn on_scan_failed(&self, session: u64, code: i32) {
        self.finish(Some(session), FinishReason::Failed { code });
    }
}

/// Runs discovery sessions, one at a time.
pub struct Scanner {
    shared: Arc<ScanShared>,
    config: ScanConfig,
    handle: Handle,
    parent: CancellationToken,
}

impl Scanner {
    /// Creates a scanner whose tasks stop when `parent` is cancelled.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        config: ScanConfig,
        handle: Handle,
        parent: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                adapter,
                state: Mutex::new(ScanState::default()),
            }),
            config,
            handle,
            parent,
        }
    }

    /// Starts scanning, or joins the running scan.
    ///
    /// While a scan is running the filter and timeout of this call are ignored
    /// and a new subscription to the running scan is returned.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` without the scan permission and
    /// `AdapterUnavailable` if the native scanner refuses to start.
    pub fn start_scan(
        &self,
        filter: ScanFilter,
        timeout: Option<Duration>,
    ) -> Result<ScanSubscription> {
        if !self.shared.adapter.check_permission(Permission::Scan) {
            return Err(Error::PermissionDenied {
                permission: Permission::Scan,
            });
        }

        let (session, events, cancel, reports) = {
            let mut state = self.shared.state.lock();
            if let Some(active) = &state.active {
                tracing::debug!("scan {} already running, joining", active.session);
                return Ok(ScanSubscription {
                    receiver: active.events.subscribe(),
                });
            }
            state.next_session += 1;
            let session = state.next_session;
            let (events, _) = broadcast::channel(EVENT_CAPACITY);
            let cancel = self.parent.child_token();
            let reports = mpsc::channel(self.config.buffer_capacity.max(1));
            state.active = Some(ActiveScan {
                session,
                events: events.clone(),
                cancel: cancel.clone(),
            });
            (session, events, cancel, reports)
        };
        let subscription = ScanSubscription {
            receiver: events.subscribe(),
        };
        let (tx, rx) = reports;

        let weak = Arc::downgrade(&self.shared);
        let sink: Weak<dyn ScanFailureSink> = weak;
        let callbacks = ScanCallbacks::new(session, Arc::new(filter), tx, sink);
        if let Err(e) = self.shared.adapter.start_scan(callbacks) {
            tracing::warn!("native scan refused: {}", e);
            let mut state = self.shared.state.lock();
            if state.active.as_ref().is_some_and(|a| a.session == session) {
                state.active = None;
            }
            cancel.cancel();
            return Err(Error::AdapterUnavailable { reason: e.reason });
        }

        let timeout = timeout.unwrap_or(self.config.timeout);
        tracing::info!("scan {} started, timeout {:?}", session, timeout);

        let working: WorkingSet = Arc::default();
        self.handle.spawn(consume_reports(
            rx,
            Arc::clone(&working),
            self.config.min_rssi,
            cancel.clone(),
        ));
        self.handle.spawn(emit_snapshots(
            Arc::downgrade(&self.shared),
            session,
            working,
            self.config.clone(),
            cancel.clone(),
        ));
        let shared = Arc::downgrade(&self.shared);
        self.handle.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.finish(Some(session), FinishReason::Timeout);
                    }
                }
            }
        });

        Ok(subscription)
    }

    /// Stops the running scan. Returns false if none was running.
    pub fn stop_scan(&self) -> bool {
        self.shared.finish(None, FinishReason::Manual)
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.shared.state.lock().active.is_some()
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("config", &self.config)
            .field("scanning", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

async fn consume_reports(
    mut reports: mpsc::Receiver<ScanResult>,
    working: WorkingSet,
    min_rssi: i16,
    cancel: CancellationToken,
) {
    loop {
        let report = tokio::select! {
            () = cancel.cancelled() => break,
            report = reports.recv() => report,
        };
        let Some(report) = report else { break };

        let mut set = working.lock();
        if report.rssi < min_rssi {
            if set.remove(&report.address).is_some() {
                tracing::trace!("{} fell below rssi floor", report.address);
            }
        } else {
            tracing::trace!("report {} rssi {}", report.address, report.rssi);
            set.insert(report.address, report);
        }
    }
    working.lock().clear();
}

async fn emit_snapshots(
    shared: Weak<ScanShared>,
    session: u64,
    working: WorkingSet,
    config: ScanConfig,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.emit_interval,
        config.emit_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let results = snapshot(&working, &config, Instant::now());
        let event = if config.single_result {
            ScanEvent::Nearest(results.into_iter().next())
        } else {
            ScanEvent::Results(results)
        };
        let Some(shared) = shared.upgrade() else { break };
        if !shared.emit(session, event) {
            break;
        }
    }
}

/// Purges expired entries and returns the filtered, sorted snapshot.
fn snapshot(working: &WorkingSet, config: &ScanConfig, now: Instant) -> Vec<ScanResult> {
    let mut set = working.lock();
    set.retain(|_, r| now.duration_since(r.last_seen) < config.expired_after);
    let mut results: Vec<ScanResult> = set
        .values()
        .filter(|r| r.rssi >= config.min_rssi)
        .filter(|r| !config.filter_unnamed || r.is_named())
        .cloned()
        .collect();
    drop(set);

    if config.sort_by_rssi {
        results.sort_by(|a, b| b.rssi.cmp(&a.rssi).then(a.address.cmp(&b.address)));
    } else {
        results.sort_by_key(|r| r.address);
    }
    results
}
