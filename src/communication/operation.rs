//! Queued GATT operations.

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{CCCD_UUID, CharacteristicTarget, WriteKind};

/// How an operation reports its result.
pub(crate) enum Completion<T> {
    /// An awaiting caller.
    Channel(oneshot::Sender<Result<T>>),
    /// A fire-and-forget caller.
    Callback(Box<dyn FnOnce(Result<T>) + Send>),
}

impl<T> Completion<T> {
    pub(crate) fn complete(self, result: Result<T>) {
        match self {
            Self::Channel(tx) => {
                // the caller may have given up already
                let _ = tx.send(result);
            }
            Self::Callback(callback) => callback(result),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("Channel"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Notification subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyRequest {
    /// Descriptor written to enable delivery.
    pub descriptor: Uuid,
    /// Request indications instead of notifications.
    pub indicate: bool,
}

impl Default for NotifyRequest {
    fn default() -> Self {
        Self {
            descriptor: CCCD_UUID,
            indicate: false,
        }
    }
}

impl NotifyRequest {
    /// Notifications through the standard configuration descriptor.
    #[must_use]
    pub fn notifications() -> Self {
        Self::default()
    }

    /// Indications through the standard configuration descriptor.
    #[must_use]
    pub const fn indications() -> Self {
        Self {
            descriptor: CCCD_UUID,
            indicate: true,
        }
    }

    /// Uses a non-standard descriptor.
    #[must_use]
    pub const fn descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptor = descriptor;
        self
    }
}

#[derive(Debug)]
pub(crate) enum OperationKind {
    Write {
        payload: Bytes,
        kind: WriteKind,
        done: Completion<usize>,
    },
    Read {
        done: Completion<Bytes>,
    },
    EnableNotify {
        request: NotifyRequest,
        done: Completion<()>,
    },
}

/// One request waiting in the queue.
#[derive(Debug)]
pub(crate) struct Operation {
    pub target: CharacteristicTarget,
    pub kind: OperationKind,
}

impl Operation {
    pub(crate) const fn label(&self) -> &'static str {
        match self.kind {
            OperationKind::Write { .. } => "write",
            OperationKind::Read { .. } => "read",
            OperationKind::EnableNotify { .. } => "enable-notify",
        }
    }

    /// Completes the operation as failed without executing it.
    pub(crate) fn fail(self, error: Error) {
        match self.kind {
            OperationKind::Write { done, .. } => done.complete(Err(error)),
            OperationKind::Read { done } => done.complete(Err(error)),
            OperationKind::EnableNotify { done, .. } => done.complete(Err(error)),
        }
    }
}

/// Splits a payload into packets of at most `max` bytes.
///
/// An empty payload still yields one empty packet.
pub(crate) fn split_payload(payload: &Bytes, max: usize) -> Vec<Bytes> {
    let max = max.max(1);
    if payload.len() <= max {
        return vec![payload.clone()];
    }
    (0..payload.len())
        .step_by(max)
        .map(|start| payload.slice(start..(start + max).min(payload.len())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_counts() {
        let payload = Bytes::from((0..=255u8).collect::<Vec<_>>());
        for max in [1, 7, 20, 244, 256, 1000] {
            let chunks = split_payload(&payload, max);
            assert_eq!(chunks.len(), payload.len().div_ceil(max));
            assert!(chunks.iter().all(|c| c.len() <= max));
            assert_eq!(chunks.concat(), payload.to_vec());
        }
    }

    #[test]
    fn test_split_empty() {
        let chunks = split_payload(&Bytes::new(), 20);
        assert_eq!(chunks, vec![Bytes::new()]);
    }

    #[tokio::test]
    async fn test_fail_reaches_caller() {
        let (tx, rx) = oneshot::channel();
        let op = Operation {
            target: CharacteristicTarget::new(
                crate::types::DeviceAddress::new([1; 6]),
                Uuid::nil(),
                Uuid::nil(),
            ),
            kind: OperationKind::Read {
                done: Completion::Channel(tx),
            },
        };
        assert_eq!(op.label(), "read");
        op.fail(Error::Cancelled);
        assert_eq!(rx.await.unwrap(), Err(Error::Cancelled));
    }
}
