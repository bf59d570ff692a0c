//! Connection health of one bridge leg
//!
//! The OPC UA source and the MQTT sink each own a `LegMonitor` and publish
//! their connection state through it. The bridge session watches both
//! monitors to derive the transfer status without touching the connections.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Which side of the bridge a leg is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Source,
    Sink,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Source => "source",
            Leg::Sink => "sink",
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegStatus {
    /// First connection attempt in progress
    Connecting,
    /// Connected and operational
    Up,
    /// Connection lost, backing off between attempts
    Reconnecting { failures: u32 },
    /// Failure budget spent, will not retry
    Unavailable(String),
    /// Closed on request
    Closed,
}

impl LegStatus {
    /// Whether the leg is backing off between reconnect attempts
    pub fn is_degraded(&self) -> bool {
        matches!(self, LegStatus::Reconnecting { .. })
    }
}

/// Shared view of one leg's state and last successful activity
#[derive(Debug)]
pub struct LegMonitor {
    leg: Leg,
    status: watch::Sender<LegStatus>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl LegMonitor {
    pub fn new(leg: Leg) -> Arc<Self> {
        let (status, _) = watch::channel(LegStatus::Connecting);
        Arc::new(Self {
            leg,
            status,
            last_activity: Mutex::new(None),
        })
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn status(&self) -> LegStatus {
        self.status.borrow().clone()
    }

    /// Publish a new state; unchanged states do not wake watchers
    pub fn set_status(&self, status: LegStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Record a successful operation (delivered event, acknowledged publish)
    pub fn touch(&self) {
        *self.last_activity.lock() = Some(Utc::now());
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        *self.last_activity.lock()
    }

    pub fn subscribe(&self) -> watch::Receiver<LegStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unchanged_status_does_not_notify() {
        let monitor = LegMonitor::new(Leg::Sink);
        let mut rx = monitor.subscribe();

        monitor.set_status(LegStatus::Up);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        monitor.set_status(LegStatus::Up);
        assert!(!rx.has_changed().unwrap());

        monitor.set_status(LegStatus::Reconnecting { failures: 1 });
        assert!(rx.has_changed().unwrap());
        assert!(monitor.status().is_degraded());
    }

    #[test]
    fn touch_records_activity() {
        let monitor = LegMonitor::new(Leg::Source);
        assert!(monitor.last_activity().is_none());
        monitor.touch();
        assert!(monitor.last_activity().is_some());
        assert_eq!(monitor.leg().to_string(), "source");
    }
}
