//! Configuration for scanning, connecting and GATT communication.
//!
//! All options are plain values with defaults; none of them carry behavior.

use std::time::Duration;

/// Default ATT MTU every BLE link starts with.
pub const DEFAULT_MTU: u16 = 23;

/// ATT header bytes subtracted from the MTU to get the usable payload size.
pub const ATT_HEADER_LEN: u16 = 3;

/// Extra time the operation worker allows on top of the communicate timeout.
pub const OPERATION_GRACE: Duration = Duration::from_millis(500);

/// Extra time an awaiting caller allows on top of the communicate timeout.
///
/// Larger than [`OPERATION_GRACE`] so the worker always reports first.
pub const CALLER_GRACE: Duration = Duration::from_secs(3);

/// Usable payload for a given MTU.
#[must_use]
pub const fn max_packet_size(mtu: u16) -> usize {
    if mtu > ATT_HEADER_LEN {
        (mtu - ATT_HEADER_LEN) as usize
    } else {
        1
    }
}

/// Scan behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Scan duration when `start_scan` is given no explicit timeout.
    pub timeout: Duration,
    /// Reports weaker than this RSSI (dBm) are discarded.
    pub min_rssi: i16,
    /// Drop devices that advertise no name from snapshots.
    pub filter_unnamed: bool,
    /// A device not seen for this long is aged out of snapshots.
    pub expired_after: Duration,
    /// Interval between snapshot emissions.
    pub emit_interval: Duration,
    /// Sort snapshots by descending RSSI.
    pub sort_by_rssi: bool,
    /// Emit only the strongest device instead of the full list.
    pub single_result: bool,
    /// Capacity of the raw report buffer between the native callback and the consumer.
    pub buffer_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            min_rssi: -100,
            filter_unnamed: true,
            expired_after: Duration::from_millis(2000),
            emit_interval: Duration::from_millis(200),
            sort_by_rssi: true,
            single_result: false,
            buffer_capacity: 64,
        }
    }
}

impl ScanConfig {
    /// Sets the default scan timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the RSSI floor.
    #[must_use]
    pub const fn min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = rssi;
        self
    }

    /// Keeps or drops unnamed devices.
    #[must_use]
    pub const fn filter_unnamed(mut self, filter: bool) -> Self {
        self.filter_unnamed = filter;
        self
    }

    /// Sets the freshness window.
    #[must_use]
    pub const fn expired_after(mut self, window: Duration) -> Self {
        self.expired_after = window;
        self
    }

    /// Sets the snapshot emission interval.
    #[must_use]
    pub const fn emit_interval(mut self, interval: Duration) -> Self {
        self.emit_interval = interval;
        self
    }

    /// Enables single-result mode.
    #[must_use]
    pub const fn single_result(mut self, single: bool) -> Self {
        self.single_result = single;
        self
    }
}

/// Connection limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectConfig {
    /// Maximum number of simultaneously active links. `1` enables single-link mode.
    pub max_connections: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self { max_connections: 3 }
    }
}

impl ConnectConfig {
    /// Sets the maximum number of active links.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Automatic reconnection after an abnormal disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Whether abnormal disconnects trigger reconnection.
    pub enabled: bool,
    /// Delay before each attempt.
    pub delay: Duration,
    /// Attempts allowed before giving up.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(4000),
            max_retries: 30,
        }
    }
}

impl ReconnectConfig {
    /// Disables automatic reconnection.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_millis(4000),
            max_retries: 0,
        }
    }

    /// Sets the delay before each attempt.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// GATT communication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicateConfig {
    /// MTU requested after service discovery.
    pub mtu: u16,
    /// Time to wait for each native callback.
    pub timeout: Duration,
    /// Pause after each write-without-response chunk.
    pub no_response_pacing: Duration,
}

impl Default for CommunicateConfig {
    fn default() -> Self {
        Self {
            mtu: 240,
            timeout: Duration::from_millis(5000),
            no_response_pacing: Duration::from_millis(10),
        }
    }
}

impl CommunicateConfig {
    /// Sets the MTU to request.
    #[must_use]
    pub const fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Sets the per-callback timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Complete configuration for a [`BleManager`](crate::BleManager).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub scan: ScanConfig,
    pub connect: ConnectConfig,
    pub reconnect: ReconnectConfig,
    pub communicate: CommunicateConfig,
}

impl DeviceConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the scan settings.
    #[must_use]
    pub fn scan(mut self, scan: ScanConfig) -> Self {
        self.scan = scan;
        self
    }

    /// Replaces the connection limits.
    #[must_use]
    pub const fn connect(mut self, connect: ConnectConfig) -> Self {
        self.connect = connect;
        self
    }

    /// Replaces the reconnection settings.
    #[must_use]
    pub const fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Replaces the communication settings.
    #[must_use]
    pub const fn communicate(mut self, communicate: CommunicateConfig) -> Self {
        self.communicate = communicate;
        self
    }

    /// Returns true when at most one link may be active.
    #[must_use]
    pub const fn is_single_link(&self) -> bool {
        self.connect.max_connections == 1
    }
}
