//! OPC UA client seam
//!
//! `OpcUaValueSource` drives sessions through these traits so the retry and
//! subscription logic is independent of the client stack underneath. The
//! `opcua` crate backend and the in-process simulated server both implement
//! them.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::{NodeId, SourceError};
use crate::config::{SecurityMode, SecurityPolicy};
use crate::credentials::Secret;
use crate::value::ValueChangeEvent;

/// User identity presented when activating a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    UserName { username: String, password: Secret },
    X509 { cert_path: PathBuf, key_path: PathBuf },
}

/// Everything needed to establish one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParams {
    pub endpoint: String,
    pub security_policy: SecurityPolicy,
    pub security_mode: SecurityMode,
    pub identity: Identity,
    /// Per-attempt establishment timeout
    pub timeout: Duration,
}

/// Nodes sharing one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGroup {
    /// `None` requests the server's minimum interval
    pub sampling_interval: Option<Duration>,
    pub nodes: Vec<NodeId>,
}

/// Opens sessions against an OPC UA server
#[async_trait]
pub trait OpcUaConnector: Send + Sync {
    async fn connect(&self, params: &SessionParams) -> Result<Box<dyn OpcUaSession>, SourceError>;
}

/// One live OPC UA session
#[async_trait]
pub trait OpcUaSession: Send + Sync {
    /// Create a subscription with one monitored item per node
    ///
    /// Returns the server-assigned subscription id.
    async fn create_subscription(&mut self, group: &SubscriptionGroup)
        -> Result<u32, SourceError>;

    /// Next notification, in server delivery order
    ///
    /// An error means the session is gone (network loss or server-side
    /// termination). Must be cancel safe.
    async fn next_event(&mut self) -> Result<ValueChangeEvent, SourceError>;

    /// Notifications the session discarded since the last call
    fn take_dropped(&self) -> u64 {
        0
    }

    /// Tear down subscriptions and the session
    async fn close(&mut self);
}
