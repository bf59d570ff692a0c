//! In-process OPC UA server
//!
//! Implements [`OpcUaConnector`] without a network so bridge sessions can be
//! exercised end to end. Tests drive it by emitting value changes, dropping
//! connections, and refusing new sessions for a while.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::queue::{NotificationQueue, NotificationSender};
use super::{
    Identity, NodeId, OpcUaConnector, OpcUaSession, SessionParams, SourceError,
    SubscriptionGroup,
};
use crate::value::{Quality, Value, ValueChangeEvent};

/// Notifications a session buffers unless configured otherwise
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct SessionSlot {
    monitored: HashSet<NodeId>,
    tx: NotificationSender,
}

struct Inner {
    available: bool,
    current: HashMap<NodeId, ValueChangeEvent>,
    sessions: HashMap<u64, SessionSlot>,
    next_session: u64,
    next_subscription: u32,
    connects: usize,
    subscriptions: Vec<SubscriptionGroup>,
    rejected_nodes: HashSet<NodeId>,
    identities: Vec<Identity>,
    queue_capacity: usize,
}

/// Simulated OPC UA server; clones share state
#[derive(Clone)]
pub struct SimulatedServer {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                current: HashMap::new(),
                sessions: HashMap::new(),
                next_session: 1,
                next_subscription: 1,
                connects: 0,
                subscriptions: Vec::new(),
                rejected_nodes: HashSet::new(),
                identities: Vec::new(),
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
            })),
        }
    }

    /// Bound each session's notification queue; overflow is dropped
    pub fn with_queue_capacity(self, capacity: usize) -> Self {
        self.inner.lock().queue_capacity = capacity;
        self
    }

    /// Publish a value change to every session monitoring the node
    pub fn emit(&self, event: ValueChangeEvent) {
        let mut inner = self.inner.lock();
        for slot in inner.sessions.values() {
            if slot.monitored.contains(&event.node_id) {
                slot.tx.push(event.clone());
            }
        }
        inner.current.insert(event.node_id.clone(), event);
    }

    /// Emit a good-quality value with the given source timestamp
    pub fn set_value(&self, node_id: &NodeId, value: Value, source_timestamp: DateTime<Utc>) {
        self.emit(ValueChangeEvent {
            node_id: node_id.clone(),
            value,
            source_timestamp: Some(source_timestamp),
            server_timestamp: Some(Utc::now()),
            quality: Quality::good(),
        });
    }

    /// Drop every open session as a network failure would
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        for (_, slot) in inner.sessions.drain() {
            slot.tx.lose("connection reset by peer");
        }
    }

    /// Refuse (`false`) or accept (`true`) new sessions
    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    /// Make subscriptions that include this node fail
    pub fn reject_node(&self, node_id: NodeId) {
        self.inner.lock().rejected_nodes.insert(node_id);
    }

    /// Sessions opened so far
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connects
    }

    /// Sessions currently open
    pub fn active_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Every subscription created, in order
    pub fn subscriptions(&self) -> Vec<SubscriptionGroup> {
        self.inner.lock().subscriptions.clone()
    }

    /// Identities presented by clients, in connect order
    pub fn identities(&self) -> Vec<Identity> {
        self.inner.lock().identities.clone()
    }
}

#[async_trait]
impl OpcUaConnector for SimulatedServer {
    async fn connect(&self, params: &SessionParams) -> Result<Box<dyn OpcUaSession>, SourceError> {
        let mut inner = self.inner.lock();
        if !inner.available {
            return Err(SourceError::ConnectFailed(format!(
                "{}: connection refused",
                params.endpoint
            )));
        }
        inner.connects += 1;
        inner.identities.push(params.identity.clone());

        let id = inner.next_session;
        inner.next_session += 1;
        let (tx, queue) = NotificationQueue::bounded(inner.queue_capacity);
        inner.sessions.insert(
            id,
            SessionSlot {
                monitored: HashSet::new(),
                tx,
            },
        );

        Ok(Box::new(SimulatedSession {
            id,
            server: self.clone(),
            queue,
        }))
    }
}

struct SimulatedSession {
    id: u64,
    server: SimulatedServer,
    queue: NotificationQueue,
}

#[async_trait]
impl OpcUaSession for SimulatedSession {
    async fn create_subscription(
        &mut self,
        group: &SubscriptionGroup,
    ) -> Result<u32, SourceError> {
        let mut inner = self.server.inner.lock();
        if let Some(node) = group
            .nodes
            .iter()
            .find(|n| inner.rejected_nodes.contains(*n))
        {
            return Err(SourceError::SubscriptionFailed(format!(
                "BadNodeIdUnknown: {}",
                node
            )));
        }

        // New monitored items report the current value first
        let initial: Vec<ValueChangeEvent> = group
            .nodes
            .iter()
            .filter_map(|n| inner.current.get(n).cloned())
            .collect();

        let Some(slot) = inner.sessions.get_mut(&self.id) else {
            return Err(SourceError::SessionLost("session closed".to_string()));
        };
        slot.monitored.extend(group.nodes.iter().cloned());
        for event in initial {
            slot.tx.push(event);
        }

        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.subscriptions.push(group.clone());
        Ok(id)
    }

    async fn next_event(&mut self) -> Result<ValueChangeEvent, SourceError> {
        self.queue.next().await
    }

    fn take_dropped(&self) -> u64 {
        self.queue.take_dropped()
    }

    async fn close(&mut self) {
        self.server.inner.lock().sessions.remove(&self.id);
    }
}

// A client that goes away without closing still frees its server session
impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.server.inner.lock().sessions.remove(&self.id);
    }
}
