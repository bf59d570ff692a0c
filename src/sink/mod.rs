//! MQTT sink
//!
//! `MqttSink` owns one MQTT client connection for one transfer. Publishes are
//! queued on a bounded command channel and written by a single connection
//! task, so writes to the socket are serialized. The task reconnects with
//! bounded backoff, retransmits unacknowledged QoS 1/2 publishes with the DUP
//! flag after a reconnect, and gives up with `Unavailable` once the failure
//! budget is spent.

mod connection;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{BackoffConfig, TransferSpec};
use crate::credentials::CredentialResolver;
use crate::leg::{Leg, LegMonitor, LegStatus};
use crate::protocol::ReasonCode;
use crate::translate::SinkMessage;

use connection::{Connection, ConnectionParams};

/// Time the connection task gets to send DISCONNECT after an abort
const ABORT_GRACE: Duration = Duration::from_secs(1);

/// MQTT leg errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Connection could not be established (retried)
    ConnectFailed(String),
    /// The broker refused the publish; the message is dropped
    PublishRejected { topic: String, reason: ReasonCode },
    /// Send buffer is full
    Backpressure,
    /// Failure budget spent; the sink will not retry
    Unavailable { attempts: u32, last_error: String },
    /// Close did not drain all publishes in time
    FlushTimeout { pending: usize },
    /// The sink was closed
    Closed,
}

impl SinkError {
    /// Short error kind for status details and logs
    pub fn kind(&self) -> &'static str {
        match self {
            SinkError::ConnectFailed(_) => "ConnectFailed",
            SinkError::PublishRejected { .. } => "PublishRejected",
            SinkError::Backpressure => "Backpressure",
            SinkError::Unavailable { .. } => "Unavailable",
            SinkError::FlushTimeout { .. } => "FlushTimeout",
            SinkError::Closed => "Closed",
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::ConnectFailed(msg) => write!(f, "MQTT connect failed: {}", msg),
            SinkError::PublishRejected { topic, reason } => {
                write!(f, "broker rejected publish to '{}': {}", topic, reason)
            }
            SinkError::Backpressure => write!(f, "MQTT send buffer full"),
            SinkError::Unavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "MQTT broker unavailable after {} attempts: {}",
                attempts, last_error
            ),
            SinkError::FlushTimeout { pending } => {
                write!(f, "flush timed out with {} publishes pending", pending)
            }
            SinkError::Closed => write!(f, "sink closed"),
        }
    }
}

impl std::error::Error for SinkError {}

/// Engine settings the sink needs besides the transfer spec
#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Publishes buffered while the connection is busy or down
    pub channel_capacity: usize,
    /// Unacknowledged QoS 1/2 publishes on the wire
    pub max_inflight: u16,
    pub keep_alive: u16,
}

pub(crate) enum Command {
    Publish {
        message: SinkMessage,
        done: oneshot::Sender<Result<(), SinkError>>,
    },
    /// Flush everything queued before this command, then disconnect
    Close { done: oneshot::Sender<()> },
}

/// Outcome of one accepted publish
///
/// Resolves once the message is written (QoS 0) or acknowledged by the
/// broker (QoS 1 and 2).
#[derive(Debug)]
pub struct Delivery {
    rx: oneshot::Receiver<Result<(), SinkError>>,
}

impl Future for Delivery {
    type Output = Result<(), SinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SinkError::Closed)))
    }
}

/// One transfer's MQTT client
pub struct MqttSink {
    transfer_id: String,
    commands: mpsc::Sender<Command>,
    abort: watch::Sender<bool>,
    pending: Arc<AtomicUsize>,
    monitor: Arc<LegMonitor>,
    /// Terminal error recorded by the connection task
    failure: Arc<Mutex<Option<SinkError>>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for MqttSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSink")
            .field("transfer_id", &self.transfer_id)
            .field("pending", &self.pending())
            .field("status", &self.monitor.status())
            .finish()
    }
}

impl MqttSink {
    /// Connect to the broker
    ///
    /// Retries with backoff; fails with `Unavailable` once the failure budget
    /// is spent.
    pub async fn open(
        spec: &TransferSpec,
        credentials: Arc<dyn CredentialResolver>,
        options: SinkOptions,
    ) -> Result<Self, SinkError> {
        let address = spec
            .sink
            .broker_address()
            .map_err(|e| SinkError::ConnectFailed(e.to_string()))?;

        let (commands, command_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (abort, abort_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let monitor = LegMonitor::new(Leg::Sink);
        let failure = Arc::new(Mutex::new(None));

        let connection = Connection::new(
            ConnectionParams::from_spec(spec, address, &options),
            credentials,
            options.backoff.clone(),
            command_rx,
            abort_rx,
            pending.clone(),
            monitor.clone(),
            failure.clone(),
        );
        let task = tokio::spawn(connection.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                transfer_id: spec.id.clone(),
                commands,
                abort,
                pending,
                monitor,
                failure,
                task: Some(task),
            }),
            Ok(Err(e)) => {
                let _ = task.await;
                Err(e)
            }
            Err(_) => Err(SinkError::Closed),
        }
    }

    /// Queue a message without waiting
    ///
    /// Fails fast with `Backpressure` when the send buffer is full.
    pub fn submit(&self, message: SinkMessage) -> Result<Delivery, SinkError> {
        let (done, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.commands.try_send(Command::Publish { message, done }) {
            Ok(()) => Ok(Delivery { rx }),
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(SinkError::Backpressure),
                    mpsc::error::TrySendError::Closed(_) => Err(self.closed_error()),
                }
            }
        }
    }

    /// Publish and wait for the delivery guarantee of the message's QoS
    pub async fn publish(&self, message: SinkMessage) -> Result<(), SinkError> {
        self.submit(message)?.await
    }

    /// Publishes accepted but not yet resolved
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn monitor(&self) -> Arc<LegMonitor> {
        self.monitor.clone()
    }

    pub fn health(&self) -> LegStatus {
        self.monitor.status()
    }

    /// Flush accepted publishes for at most `timeout`, then disconnect
    ///
    /// Publishes still unresolved at the deadline fail with `Closed` and the
    /// call returns `FlushTimeout`. With nothing pending the flush is skipped.
    pub async fn close(&mut self, timeout: Duration) -> Result<(), SinkError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        if self.pending() == 0 {
            self.shut_down(task).await;
            return Ok(());
        }

        let (done, flushed) = oneshot::channel();
        let commands = &self.commands;
        let flush = async move {
            // An error means the connection task already ended
            if commands.send(Command::Close { done }).await.is_ok() {
                let _ = flushed.await;
            }
        };
        let result = match tokio::time::timeout(timeout, flush).await {
            Ok(()) => Ok(()),
            Err(_) => {
                let pending = self.pending();
                warn!(transfer = %self.transfer_id, pending, "MQTT flush timed out");
                Err(SinkError::FlushTimeout { pending })
            }
        };

        self.shut_down(task).await;
        result
    }

    /// Disconnect without flushing; unresolved publishes fail with `Closed`
    pub async fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            self.shut_down(task).await;
        }
    }

    async fn shut_down(&self, mut task: JoinHandle<()>) {
        let _ = self.abort.send(true);
        if tokio::time::timeout(ABORT_GRACE, &mut task).await.is_err() {
            task.abort();
        }
        self.monitor.set_status(LegStatus::Closed);
        debug!(transfer = %self.transfer_id, "MQTT sink closed");
    }

    fn closed_error(&self) -> SinkError {
        self.failure.lock().clone().unwrap_or(SinkError::Closed)
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        let _ = self.abort.send(true);
    }
}
