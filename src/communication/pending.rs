//! Correlation table between dispatched requests and native callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::DeviceAddress;

/// Correlation key: one outstanding exchange per characteristic per device.
pub(crate) type PendingKey = (DeviceAddress, Uuid);

struct PendingEntry {
    id: u64,
    deadline: Instant,
    sink: oneshot::Sender<Result<Bytes>>,
}

/// Waiters keyed by `(address, characteristic)`.
///
/// Registering under an occupied key cancels the previous waiter.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<PendingKey, PendingEntry>>,
    next_id: AtomicU64,
}

/// A registered waiter. Dropping it removes the entry if it is still the live one.
pub(crate) struct Registration {
    table: Arc<PendingTable>,
    key: PendingKey,
    id: u64,
    deadline: Instant,
    receiver: oneshot::Receiver<Result<Bytes>>,
}

impl Registration {
    /// Waits for the callback, failing with `Timeout` at the deadline.
    ///
    /// A dropped sink means the entry was evicted or cancelled.
    pub(crate) async fn wait(mut self, timeout: std::time::Duration) -> Result<Bytes> {
        match tokio::time::timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                tracing::warn!(
                    "no callback for {}/{} within {:?}",
                    self.key.0,
                    self.key.1,
                    timeout
                );
                Err(Error::timeout(timeout))
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.evict(self.key, self.id);
    }
}

impl PendingTable {
    /// Registers a waiter that expires `timeout` from now.
    pub(crate) fn register(
        self: &Arc<Self>,
        key: PendingKey,
        timeout: std::time::Duration,
    ) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        let (sink, receiver) = oneshot::channel();

        let stale = self.entries.lock().insert(
            key,
            PendingEntry {
                id,
                deadline,
                sink,
            },
        );
        if let Some(stale) = stale {
            tracing::debug!(
                "cancelling stale waiter on {}/{}, {:?} before its deadline",
                key.0,
                key.1,
                stale.deadline.saturating_duration_since(Instant::now())
            );
            let _ = stale.sink.send(Err(Error::Cancelled));
        }

        Registration {
            table: Arc::clone(self),
            key,
            id,
            deadline,
            receiver,
        }
    }

    /// Completes the waiter for `key`. Returns false if nobody was waiting.
    pub(crate) fn resolve(&self, key: PendingKey, result: Result<Bytes>) -> bool {
        let entry = self.entries.lock().remove(&key);
        match entry {
            Some(entry) => entry.sink.send(result).is_ok(),
            None => {
                tracing::debug!("callback for {}/{} with no waiter", key.0, key.1);
                false
            }
        }
    }

    /// Removes the entry for `key` only if it is still registration `id`.
    fn evict(&self, key: PendingKey, id: u64) {
        let mut entries = self.entries.lock();
        if entries.get(&key).is_some_and(|e| e.id == id) {
            entries.remove(&key);
        }
    }

    /// Fails every waiter for one device. Returns how many were failed.
    pub(crate) fn fail_address(&self, address: DeviceAddress, error: &Error) -> usize {
        let failed: Vec<PendingEntry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<PendingKey> = entries
                .keys()
                .filter(|(a, _)| *a == address)
                .copied()
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = failed.len();
        for entry in failed {
            let _ = entry.sink.send(Err(error.clone()));
        }
        count
    }

    /// Cancels every waiter. Returns how many were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.sink.send(Err(Error::Cancelled));
        }
        count
    }

    pub(crate) fn contains(&self, key: PendingKey) -> bool {
        self.entries.lock().contains_key(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
