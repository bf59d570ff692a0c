//! Bridge registry
//!
//! Process-wide table of live sessions keyed by transfer-process id. The
//! control surface of the orchestration layer calls into it; sessions remove
//! their own entry when they finish.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use tracing::{debug, info};

use super::session::{Control, Session, SessionContext, Sessions};
use super::status::Status;
use crate::topic::TopicContext;

/// Registry errors, surfaced synchronously to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The transfer-process id already has a live session
    DuplicateTransfer(String),
    /// No live session for the transfer-process id
    NotFound(String),
    /// The transfer spec failed validation
    InvalidSpec(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateTransfer(id) => {
                write!(f, "transfer '{}' already has an active session", id)
            }
            RegistryError::NotFound(id) => write!(f, "no active session for transfer '{}'", id),
            RegistryError::InvalidSpec(reason) => write!(f, "invalid transfer spec: {}", reason),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Subscription details handed to the data consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointReference {
    pub transfer_id: String,
    pub broker_url: String,
    /// Topics the transfer publishes to; one per node when the template
    /// depends on the node
    pub topics: Vec<String>,
    /// Random token generated when the session started
    pub access_token: String,
}

/// Owner of every bridge session in the process
pub struct BridgeRegistry {
    sessions: Arc<Sessions>,
    context: Arc<SessionContext>,
    generation: AtomicU64,
}

impl BridgeRegistry {
    pub fn new(context: SessionContext) -> Self {
        Self {
            sessions: Arc::new(Sessions::new()),
            context: Arc::new(context),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a session and start it in the background
    ///
    /// Returns once the session is registered in `Starting`; leg failures
    /// while opening are reported through the status interface.
    pub fn start(&self, spec: crate::config::TransferSpec) -> Result<(), RegistryError> {
        spec.validate()
            .map_err(|e| RegistryError::InvalidSpec(e.to_string()))?;

        let id = spec.id.clone();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (handle, session) = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateTransfer(id)),
            Entry::Vacant(entry) => {
                let (handle, session) =
                    Session::new(spec, self.context.clone(), self.sessions.clone(), generation);
                entry.insert(handle.clone());
                (handle, session)
            }
        };

        self.context.metrics.session_started();
        handle.set_task(tokio::spawn(session.run()));
        info!(transfer = %id, "Transfer accepted");
        Ok(())
    }

    /// Current status of a live session
    pub fn status(&self, id: &str) -> Option<Status> {
        self.sessions.get(id).map(|handle| handle.status())
    }

    /// Stop the session gracefully
    ///
    /// Returns once the session has stopped consuming from the source;
    /// draining toward the broker continues up to the drain timeout.
    pub async fn terminate(&self, id: &str) -> Result<(), RegistryError> {
        let handle = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if handle.request(Control::Terminate) {
            info!(transfer = %id, "Terminating transfer");
        }
        handle.stopped().await;
        debug!(transfer = %id, "Source consumption stopped");
        Ok(())
    }

    /// Pause source consumption; the sink keeps draining
    pub fn suspend(&self, id: &str) -> Result<(), RegistryError> {
        self.control(id, Control::Suspend)
    }

    pub fn resume(&self, id: &str) -> Result<(), RegistryError> {
        self.control(id, Control::Run)
    }

    fn control(&self, id: &str, request: Control) -> Result<(), RegistryError> {
        let handle = self
            .sessions
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if handle.request(request) {
            debug!(transfer = %id, ?request, "Control request applied");
        }
        Ok(())
    }

    /// Where the consumer of a transfer can pick up its data
    pub fn endpoint(&self, id: &str) -> Option<EndpointReference> {
        let handle = self.sessions.get(id)?;
        let spec = &handle.spec;

        let render = |node: &str| {
            spec.sink
                .topic
                .render(&TopicContext {
                    node,
                    transfer: &spec.id,
                    asset: spec.asset_id.as_deref(),
                })
                .ok()
        };
        let mut topics: Vec<String> = Vec::new();
        if spec.sink.topic.depends_on_node() {
            for node in &spec.source.nodes {
                if let Some(topic) = render(&node.node_id.to_string()) {
                    if !topics.contains(&topic) {
                        topics.push(topic);
                    }
                }
            }
        } else {
            topics.extend(render(""));
        }

        Some(EndpointReference {
            transfer_id: spec.id.clone(),
            broker_url: spec.sink.broker_url.clone(),
            topics,
            access_token: handle.access_token.clone(),
        })
    }

    /// Ids and statuses of every live session
    pub fn list(&self) -> Vec<(String, Status)> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status()))
            .collect();
        sessions.sort_by(|a, b| a.0.cmp(&b.0));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Terminate every session and wait for their tasks to finish
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if handles.is_empty() {
            return;
        }
        info!(sessions = handles.len(), "Shutting down all transfers");

        for handle in &handles {
            handle.request(Control::Terminate);
        }
        let tasks = handles.iter().filter_map(|handle| handle.take_task());
        join_all(tasks).await;
    }
}

impl fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
