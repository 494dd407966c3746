//! Connection state machine types.

use std::sync::Arc;

use crate::platform::GattStatus;
use crate::types::{DeviceAddress, GattService};

/// State of one device link.
///
/// Transitions are restricted to the edges accepted by
/// [`ConnectionState::can_transition_to`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not in use.
    #[default]
    Idle,
    /// Hardware connection requested.
    Connecting { address: DeviceAddress },
    /// Hardware link established.
    Connected { address: DeviceAddress },
    /// Waiting for the service table.
    DiscoveringServices { address: DeviceAddress },
    /// MTU change requested after discovery.
    NegotiatingMtu {
        address: DeviceAddress,
        requested_mtu: u16,
    },
    /// Services available; operations may be submitted.
    Ready {
        address: DeviceAddress,
        mtu: u16,
        services: Arc<[GattService]>,
    },
    /// Link teardown in progress.
    Disconnecting { address: DeviceAddress },
    /// Link gone. `status` is the native status that ended it.
    Disconnected {
        address: DeviceAddress,
        from: StateKind,
        status: GattStatus,
    },
}

/// Discriminant of a [`ConnectionState`], without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    NegotiatingMtu,
    Ready,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    /// Returns the payload-free kind of this state.
    #[must_use]
    pub const fn kind(&self) -> StateKind {
        match self {
            Self::Idle => StateKind::Idle,
            Self::Connecting { .. } => StateKind::Connecting,
            Self::Connected { .. } => StateKind::Connected,
            Self::DiscoveringServices { .. } => StateKind::DiscoveringServices,
            Self::NegotiatingMtu { .. } => StateKind::NegotiatingMtu,
            Self::Ready { .. } => StateKind::Ready,
            Self::Disconnecting { .. } => StateKind::Disconnecting,
            Self::Disconnected { .. } => StateKind::Disconnected,
        }
    }

    /// Returns the device address, if the state carries one.
    #[must_use]
    pub const fn address(&self) -> Option<DeviceAddress> {
        match self {
            Self::Idle => None,
            Self::Connecting { address }
            | Self::Connected { address }
            | Self::DiscoveringServices { address }
            | Self::NegotiatingMtu { address, .. }
            | Self::Ready { address, .. }
            | Self::Disconnecting { address }
            | Self::Disconnected { address, .. } => Some(*address),
        }
    }

    /// Returns true while the link occupies a connection slot.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.kind().is_active()
    }

    /// Returns true once operations can be submitted.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Returns true for a disconnect caused by a non-success native status.
    #[must_use]
    pub const fn is_abnormal_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { status, .. } if !status.is_success())
    }

    /// Checks whether moving to `next` follows a legal edge.
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        self.kind().can_transition_to(next.kind())
    }
}

impl StateKind {
    /// Returns true for states that occupy a connection slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnecting | Self::Disconnected)
    }

    /// Checks whether `self -> next` is a legal edge.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use StateKind::{
            Connected, Connecting, Disconnected, Disconnecting, DiscoveringServices, Idle,
            NegotiatingMtu, Ready,
        };

        match (self, next) {
            (Idle | Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connected, DiscoveringServices)
            | (DiscoveringServices, NegotiatingMtu | Ready)
            | (NegotiatingMtu, Ready)
            | (Disconnecting, Disconnected) => true,
            (Connecting | Connected | DiscoveringServices | NegotiatingMtu | Ready, to) => {
                matches!(to, Disconnecting | Disconnected)
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::DiscoveringServices => "discovering services",
            Self::NegotiatingMtu => "negotiating mtu",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// A state transition observed on some link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub address: DeviceAddress,
    pub state: ConnectionState,
}
