//! OPC UA value source
//!
//! `OpcUaValueSource` owns one OPC UA session for one transfer. It creates a
//! subscription per distinct sampling interval and hands out value changes in
//! delivery order. Lost sessions (network failure or server-side termination)
//! are re-established with bounded backoff and their subscriptions recreated;
//! once the failure budget is spent the source reports `Unavailable` and the
//! stream ends.

mod client;
mod node;
mod queue;
#[cfg(feature = "opcua-client")]
pub mod opcua;
pub mod simulated;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use tracing::{debug, info, warn};

pub use client::{Identity, OpcUaConnector, OpcUaSession, SessionParams, SubscriptionGroup};
pub use node::{NodeId, NodeIdError, NodeIdentifier};
pub use queue::{NotificationQueue, NotificationSender};

use crate::backoff::Backoff;
use crate::config::{BackoffConfig, SourceSpec, TransferSpec};
use crate::credentials::{Credential, CredentialResolver};
use crate::leg::{Leg, LegMonitor, LegStatus};
use crate::value::ValueChangeEvent;


/// OPC UA leg errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Session could not be established (retried)
    ConnectFailed(String),
    /// Subscription or monitored item creation failed (retried)
    SubscriptionFailed(String),
    /// Established session was lost (retried)
    SessionLost(String),
    /// Failure budget spent; the source will not retry
    Unavailable { attempts: u32, last_error: String },
    /// The source was closed
    Closed,
}

impl SourceError {
    /// Short error kind for status details and logs
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::ConnectFailed(_) => "ConnectFailed",
            SourceError::SubscriptionFailed(_) => "SubscriptionFailed",
            SourceError::SessionLost(_) => "SessionLost",
            SourceError::Unavailable { .. } => "Unavailable",
            SourceError::Closed => "Closed",
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::ConnectFailed(msg) => write!(f, "OPC UA connect failed: {}", msg),
            SourceError::SubscriptionFailed(msg) => {
                write!(f, "OPC UA subscription failed: {}", msg)
            }
            SourceError::SessionLost(msg) => write!(f, "OPC UA session lost: {}", msg),
            SourceError::Unavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "OPC UA server unavailable after {} attempts: {}",
                attempts, last_error
            ),
            SourceError::Closed => write!(f, "source closed"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Engine settings the source needs besides the transfer spec
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

/// One transfer's view of an OPC UA server
pub struct OpcUaValueSource {
    transfer_id: String,
    spec: SourceSpec,
    groups: Vec<SubscriptionGroup>,
    connector: Arc<dyn OpcUaConnector>,
    credentials: Arc<dyn CredentialResolver>,
    connect_timeout: Duration,
    backoff: Backoff,
    session: Option<Box<dyn OpcUaSession>>,
    monitor: Arc<LegMonitor>,
    /// Last event handed out per node
    last_delivered: HashMap<NodeId, ValueChangeEvent>,
    /// Nodes whose first notification after a resubscribe may be a replay
    resubscribed: HashSet<NodeId>,
    /// Notifications the session discarded on overflow, not yet reported
    dropped: u64,
    finished: bool,
}

impl fmt::Debug for OpcUaValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcUaValueSource")
            .field("transfer_id", &self.transfer_id)
            .field("endpoint", &self.spec.endpoint)
            .field("status", &self.monitor.status())
            .finish()
    }
}

impl OpcUaValueSource {
    /// Establish the session and its subscriptions
    ///
    /// Retries with backoff; fails with `Unavailable` once the failure budget
    /// is spent.
    pub async fn open(
        spec: &TransferSpec,
        connector: Arc<dyn OpcUaConnector>,
        credentials: Arc<dyn CredentialResolver>,
        options: SourceOptions,
    ) -> Result<Self, SourceError> {
        let mut source = Self {
            transfer_id: spec.id.clone(),
            groups: group_by_interval(&spec.source),
            spec: spec.source.clone(),
            connector,
            credentials,
            connect_timeout: options.connect_timeout,
            backoff: Backoff::new(options.backoff),
            session: None,
            monitor: LegMonitor::new(Leg::Source),
            last_delivered: HashMap::new(),
            resubscribed: HashSet::new(),
            dropped: 0,
            finished: false,
        };
        source.establish().await?;
        Ok(source)
    }

    /// Health monitor shared with the bridge session
    pub fn monitor(&self) -> Arc<LegMonitor> {
        self.monitor.clone()
    }

    pub fn health(&self) -> LegStatus {
        self.monitor.status()
    }

    /// Subscriptions this source maintains
    pub fn subscription_groups(&self) -> &[SubscriptionGroup] {
        &self.groups
    }

    /// Next value change
    ///
    /// Reconnects transparently on session loss. Returns `Unavailable` once
    /// when the failure budget is spent and `Closed` afterwards. Cancel safe
    /// while waiting for notifications.
    pub async fn next_event(&mut self) -> Result<ValueChangeEvent, SourceError> {
        loop {
            if self.finished {
                return Err(SourceError::Closed);
            }

            let Some(session) = self.session.as_mut() else {
                self.establish().await?;
                continue;
            };

            let next = session.next_event().await;
            let dropped = session.take_dropped();
            if dropped > 0 {
                warn!(transfer = %self.transfer_id, dropped, "OPC UA notifications dropped, queue full");
                self.dropped += dropped;
            }

            match next {
                Ok(event) => {
                    if self.is_replay(&event) {
                        debug!(
                            transfer = %self.transfer_id,
                            node = %event.node_id,
                            "Dropping replayed notification after resubscribe"
                        );
                        continue;
                    }
                    self.monitor.touch();
                    self.last_delivered
                        .insert(event.node_id.clone(), event.clone());
                    return Ok(event);
                }
                Err(e) => {
                    warn!(transfer = %self.transfer_id, error = %e, "OPC UA session lost");
                    if let Some(mut lost) = self.session.take() {
                        lost.close().await;
                    }
                    self.resubscribed = self.last_delivered.keys().cloned().collect();
                    self.monitor
                        .set_status(LegStatus::Reconnecting { failures: 0 });
                }
            }
        }
    }

    /// Notifications lost to queue overflow since the last call
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    /// Lazy sequence of value changes; ends after `Unavailable` or `close`
    pub fn stream(&mut self) -> impl Stream<Item = Result<ValueChangeEvent, SourceError>> + '_ {
        stream::unfold(self, |source| async move {
            match source.next_event().await {
                Err(SourceError::Closed) => None,
                item => Some((item, source)),
            }
        })
    }

    /// Release the session and all subscriptions
    pub async fn close(&mut self) {
        self.finished = true;
        if let Some(mut session) = self.session.take() {
            session.close().await;
            info!(transfer = %self.transfer_id, "OPC UA session closed");
        }
        self.monitor.set_status(LegStatus::Closed);
    }

    /// Connect until success or until the failure budget is spent
    async fn establish(&mut self) -> Result<(), SourceError> {
        loop {
            match self.connect().await {
                Ok(session) => {
                    self.session = Some(session);
                    self.backoff.reset();
                    self.monitor.set_status(LegStatus::Up);
                    info!(
                        transfer = %self.transfer_id,
                        endpoint = %self.spec.endpoint,
                        subscriptions = self.groups.len(),
                        "OPC UA session established"
                    );
                    return Ok(());
                }
                Err(e) => match self.backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            transfer = %self.transfer_id,
                            error = %e,
                            retry_in = ?delay,
                            "OPC UA connection attempt failed"
                        );
                        self.monitor.set_status(LegStatus::Reconnecting {
                            failures: self.backoff.failures(),
                        });
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let error = SourceError::Unavailable {
                            attempts: self.backoff.failures(),
                            last_error: e.to_string(),
                        };
                        self.finished = true;
                        self.monitor
                            .set_status(LegStatus::Unavailable(error.to_string()));
                        return Err(error);
                    }
                },
            }
        }
    }

    async fn connect(&self) -> Result<Box<dyn OpcUaSession>, SourceError> {
        let params = SessionParams {
            endpoint: self.spec.endpoint.clone(),
            security_policy: self.spec.security_policy,
            security_mode: self.spec.security_mode,
            identity: self.identity().await?,
            timeout: self.connect_timeout,
        };

        let mut session =
            match tokio::time::timeout(self.connect_timeout, self.connector.connect(&params)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SourceError::ConnectFailed(format!(
                        "timed out after {:?}",
                        self.connect_timeout
                    )))
                }
            };

        for group in &self.groups {
            let created =
                tokio::time::timeout(self.connect_timeout, session.create_subscription(group))
                    .await
                    .unwrap_or_else(|_| {
                        Err(SourceError::SubscriptionFailed("timed out".to_string()))
                    });
            match created {
                Ok(id) => debug!(
                    transfer = %self.transfer_id,
                    subscription = id,
                    nodes = group.nodes.len(),
                    interval = ?group.sampling_interval,
                    "Subscription created"
                ),
                Err(e) => {
                    session.close().await;
                    return Err(e);
                }
            }
        }

        Ok(session)
    }

    /// Credentials are resolved per connection and dropped with it
    async fn identity(&self) -> Result<Identity, SourceError> {
        let Some(reference) = &self.spec.credentials else {
            return Ok(Identity::Anonymous);
        };
        let credential = self
            .credentials
            .resolve(reference)
            .await
            .map_err(|e| SourceError::ConnectFailed(e.to_string()))?;
        Ok(match credential {
            Credential::UserPassword { username, password } => {
                Identity::UserName { username, password }
            }
            Credential::Certificate {
                cert_path,
                key_path,
            } => Identity::X509 {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            },
        })
    }

    /// The first notification per node after a resubscribe repeats the
    /// current value; drop it when it was already delivered
    fn is_replay(&mut self, event: &ValueChangeEvent) -> bool {
        if !self.resubscribed.remove(&event.node_id) {
            return false;
        }
        self.last_delivered
            .get(&event.node_id)
            .is_some_and(|last| last.same_observation(event))
    }
}

/// One subscription per distinct sampling interval, shortest first
pub fn group_by_interval(spec: &SourceSpec) -> Vec<SubscriptionGroup> {
    let mut groups: BTreeMap<Option<Duration>, Vec<NodeId>> = BTreeMap::new();
    for node in &spec.nodes {
        groups
            .entry(node.sampling_interval)
            .or_default()
            .push(node.node_id.clone());
    }
    groups
        .into_iter()
        .map(|(sampling_interval, nodes)| SubscriptionGroup {
            sampling_interval,
            nodes,
        })
        .collect()
}
