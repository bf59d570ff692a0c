//! Transfer status and its reporting interface

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::metrics::Metrics;

/// Lifecycle state of one bridge session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Starting,
    Running,
    /// A leg is reconnecting or the sink is pushing back
    Degraded,
    Suspended,
    Completing,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Starting => "Starting",
            Status::Running => "Running",
            Status::Degraded => "Degraded",
            Status::Suspended => "Suspended",
            Status::Completing => "Completing",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// Gauge encoding for `uabridge_session_status`
    pub fn code(&self) -> i64 {
        match self {
            Status::Starting => 0,
            Status::Running => 1,
            Status::Degraded => 2,
            Status::Suspended => 3,
            Status::Completing => 4,
            Status::Completed => 5,
            Status::Failed => 6,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every status transition of every session
///
/// Implemented by the transfer-process controller integration.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(&self, transfer_id: &str, status: Status, detail: Option<String>);
}

/// Reporter that only logs transitions
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl StatusReporter for LogReporter {
    async fn report(&self, transfer_id: &str, status: Status, detail: Option<String>) {
        match (status, detail) {
            (Status::Failed, Some(detail)) => {
                warn!(transfer = %transfer_id, "Transfer failed: {}", detail)
            }
            (status, Some(detail)) => {
                info!(transfer = %transfer_id, %status, "Transfer status: {}", detail)
            }
            (status, None) => info!(transfer = %transfer_id, %status, "Transfer status"),
        }
    }
}

/// Authoritative status of one session
///
/// Written only by the session task, read by the registry.
pub(crate) struct StatusCell {
    transfer_id: String,
    current: RwLock<Status>,
    reporter: Arc<dyn StatusReporter>,
    metrics: Arc<Metrics>,
}

impl StatusCell {
    pub fn new(
        transfer_id: String,
        reporter: Arc<dyn StatusReporter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transfer_id,
            current: RwLock::new(Status::Starting),
            reporter,
            metrics,
        }
    }

    pub fn get(&self) -> Status {
        *self.current.read()
    }

    /// Report the initial `Starting` state
    pub async fn announce(&self) {
        self.publish(Status::Starting, None).await;
    }

    /// Record a transition and report it; repeated states are not reported
    pub async fn set(&self, status: Status, detail: Option<String>) {
        {
            let mut current = self.current.write();
            if *current == status {
                return;
            }
            *current = status;
        }
        self.publish(status, detail).await;
    }

    async fn publish(&self, status: Status, detail: Option<String>) {
        self.metrics.status_changed(&self.transfer_id, status);
        self.reporter
            .report(&self.transfer_id, status, detail)
            .await;
    }
}
