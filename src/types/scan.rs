//! Scan result types.

use tokio::time::Instant;

use crate::types::DeviceAddress;

/// One advertising device as last seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub address: DeviceAddress,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: i16,
    pub last_seen: Instant,
}

impl ScanResult {
    /// Returns true if the device advertised a non-empty name.
    #[must_use]
    pub fn is_named(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// Why a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// `stop_scan` was called.
    Manual,
    /// The scan timeout elapsed.
    Timeout,
    /// The native scanner reported a failure.
    Failed { code: i32 },
}

impl FinishReason {
    /// Returns true unless the hardware failed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Events emitted on a scan subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Periodic snapshot of the filtered, aged, sorted working set.
    Results(Vec<ScanResult>),
    /// Periodic snapshot in single-result mode: the strongest device, if any.
    Nearest(Option<ScanResult>),
    /// Terminal event; nothing follows it for this scan.
    Finished { reason: FinishReason },
}

/// Name filter applied to raw discovery reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Case-insensitive substrings; a device passes if its name contains any.
    pub names: Vec<String>,
}

impl ScanFilter {
    /// A filter that accepts every report.
    #[must_use]
    pub const fn any() -> Self {
        Self { names: Vec::new() }
    }

    /// A filter on name substrings.
    #[must_use]
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(|n| n.into().to_lowercase()).collect(),
        }
    }

    /// Checks an advertised name against the filter.
    ///
    /// Unnamed devices never pass a non-empty filter.
    #[must_use]
    pub fn matches(&self, name: Option<&str>) -> bool {
        if self.names.is_empty() {
            return true;
        }
        let Some(name) = name else {
            return false;
        };
        let name = name.to_lowercase();
        self.names.iter().any(|n| name.contains(n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_any() {
        let filter = ScanFilter::any();
        assert!(filter.matches(None));
        assert!(filter.matches(Some("whatever")));
    }

    #[test]
    fn test_filter_case_insensitive() {
        let filter = ScanFilter::names(["BBC micro:bit", "Sensor"]);
        assert!(filter.matches(Some("bbc MICRO:BIT [zogiv]")));
        assert!(filter.matches(Some("mi-sensor")));
        assert!(!filter.matches(Some("headphones")));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_finish_reason_success() {
        assert!(FinishReason::Manual.is_success());
        assert!(FinishReason::Timeout.is_success());
        assert!(!FinishReason::Failed { code: 2 }.is_success());
    }
}
