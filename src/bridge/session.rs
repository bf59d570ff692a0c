//! Bridge session
//!
//! One session moves values for one transfer. It runs three activities in a
//! single task, coupled by a bounded channel of translated messages:
//!
//! - the consumer pulls value changes from the OPC UA source, translates them
//!   and reserves channel capacity before each pull, so a full channel stops
//!   consumption;
//! - the pump hands messages to the MQTT sink and collects delivery results,
//!   holding a message back while the sink reports backpressure;
//! - the supervisor watches both legs and the control signal and derives the
//!   reported status.
//!
//! The session ends on terminate (drain, then `Completed`) or on an
//! unrecoverable leg error (`Failed`).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::status::{Status, StatusCell, StatusReporter};
use crate::config::{BridgeConfig, TransferSpec};
use crate::credentials::CredentialResolver;
use crate::leg::{Leg, LegMonitor, LegStatus};
use crate::metrics::Metrics;
use crate::sink::{Delivery, MqttSink, SinkError, SinkOptions};
use crate::source::{OpcUaConnector, OpcUaValueSource, SourceError, SourceOptions};
use crate::translate::{translate, SinkMessage, Translation};

/// Interval between submit attempts while the sink pushes back
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(50);

/// Live sessions keyed by transfer-process id
pub(crate) type Sessions = DashMap<String, Arc<SessionHandle>>;

/// Collaborators shared by every session of a registry
pub struct SessionContext {
    pub config: BridgeConfig,
    pub connector: Arc<dyn OpcUaConnector>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub reporter: Arc<dyn StatusReporter>,
    pub metrics: Arc<Metrics>,
}

impl SessionContext {
    fn source_options(&self) -> SourceOptions {
        SourceOptions {
            connect_timeout: self.config.connect_timeout,
            backoff: self.config.backoff.clone(),
        }
    }

    fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            connect_timeout: self.config.connect_timeout,
            backoff: self.config.backoff.clone(),
            channel_capacity: self.config.channel_capacity,
            max_inflight: self.config.max_inflight,
            keep_alive: self.config.keep_alive,
        }
    }
}

/// Requested run mode, written by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Suspend,
    Terminate,
}

/// Registry-side view of a running session
pub(crate) struct SessionHandle {
    pub spec: Arc<TransferSpec>,
    pub access_token: String,
    generation: u64,
    status: Arc<StatusCell>,
    control: watch::Sender<Control>,
    stopped: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Apply a control request; false when it does not fit the current mode
    pub fn request(&self, request: Control) -> bool {
        self.control.send_if_modified(|current| {
            let allowed = match (*current, request) {
                (Control::Terminate, _) => false,
                (_, Control::Terminate) => true,
                (Control::Run, Control::Suspend) | (Control::Suspend, Control::Run) => true,
                _ => false,
            };
            if allowed {
                *current = request;
            }
            allowed
        })
    }

    /// Resolves once the session no longer consumes from the source
    pub async fn stopped(&self) {
        let mut stopped = self.stopped.clone();
        // An error means the task is gone, which also stops consumption
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock() = Some(task);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }
}

/// Why a session failed, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq)]
struct Failure {
    leg: Leg,
    kind: &'static str,
    error: String,
    last_activity: Option<DateTime<Utc>>,
}

impl Failure {
    fn source(error: &SourceError, monitor: Option<&LegMonitor>) -> Self {
        Self {
            leg: Leg::Source,
            kind: error.kind(),
            error: error.to_string(),
            last_activity: monitor.and_then(|m| m.last_activity()),
        }
    }

    fn sink(error: &SinkError, monitor: Option<&LegMonitor>) -> Self {
        Self {
            leg: Leg::Sink,
            kind: error.kind(),
            error: error.to_string(),
            last_activity: monitor.and_then(|m| m.last_activity()),
        }
    }

    fn unavailable(monitor: &LegMonitor, reason: &str) -> Self {
        Self {
            leg: monitor.leg(),
            kind: "Unavailable",
            error: reason.to_string(),
            last_activity: monitor.last_activity(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} leg {}: {}; last successful activity ", self.leg, self.kind, self.error)?;
        match self.last_activity {
            Some(at) => f.write_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => f.write_str("never"),
        }
    }
}

enum Outcome {
    Terminate,
    Failed(Failure),
}

/// The session task
pub(crate) struct Session {
    spec: Arc<TransferSpec>,
    ctx: Arc<SessionContext>,
    status: Arc<StatusCell>,
    control: watch::Receiver<Control>,
    stopped: watch::Sender<bool>,
    sessions: Arc<Sessions>,
    generation: u64,
}

impl Session {
    /// Create the task and the handle the registry keeps for it
    pub fn new(
        spec: TransferSpec,
        ctx: Arc<SessionContext>,
        sessions: Arc<Sessions>,
        generation: u64,
    ) -> (Arc<SessionHandle>, Self) {
        let spec = Arc::new(spec);
        let status = Arc::new(StatusCell::new(
            spec.id.clone(),
            ctx.reporter.clone(),
            ctx.metrics.clone(),
        ));
        let (control, control_rx) = watch::channel(Control::Run);
        let (stopped, stopped_rx) = watch::channel(false);

        let handle = Arc::new(SessionHandle {
            spec: spec.clone(),
            access_token: uuid::Uuid::new_v4().simple().to_string(),
            generation,
            status: status.clone(),
            control,
            stopped: stopped_rx,
            task: Mutex::new(None),
        });
        let session = Self {
            spec,
            ctx,
            status,
            control: control_rx,
            stopped,
            sessions,
            generation,
        };
        (handle, session)
    }

    pub async fn run(self) {
        self.status.announce().await;

        let opened = {
            let mut control = self.control.clone();
            tokio::select! {
                opened = self.open_legs() => Some(opened),
                _ = terminate_requested(&mut control) => None,
            }
        };

        match opened {
            Some(Ok((source, sink))) => self.bridge(source, sink).await,
            Some(Err(failure)) => {
                self.stopped.send_replace(true);
                self.fail(failure).await;
            }
            None => {
                info!(transfer = %self.spec.id, "Transfer terminated while starting");
                self.stopped.send_replace(true);
                self.status.set(Status::Completing, None).await;
                self.status.set(Status::Completed, None).await;
            }
        }

        self.stopped.send_replace(true);
        let generation = self.generation;
        self.sessions
            .remove_if(&self.spec.id, |_, handle| handle.generation == generation);
        self.ctx.metrics.session_ended(&self.spec.id);
        debug!(transfer = %self.spec.id, "Session finished");
    }

    /// Open both legs; a leg that opened is closed again if the other failed
    async fn open_legs(&self) -> Result<(OpcUaValueSource, MqttSink), Failure> {
        let source = OpcUaValueSource::open(
            &self.spec,
            self.ctx.connector.clone(),
            self.ctx.credentials.clone(),
            self.ctx.source_options(),
        );
        let sink = MqttSink::open(
            &self.spec,
            self.ctx.credentials.clone(),
            self.ctx.sink_options(),
        );

        match tokio::join!(source, sink) {
            (Ok(source), Ok(sink)) => Ok((source, sink)),
            (Err(error), sink) => {
                if let Ok(mut sink) = sink {
                    sink.abort().await;
                }
                Err(Failure::source(&error, None))
            }
            (Ok(mut source), Err(error)) => {
                source.close().await;
                Err(Failure::sink(&error, None))
            }
        }
    }

    async fn bridge(&self, mut source: OpcUaValueSource, mut sink: MqttSink) {
        let source_monitor = source.monitor();
        let sink_monitor = sink.monitor();
        self.status.set(Status::Running, None).await;
        info!(
            transfer = %self.spec.id,
            endpoint = %self.spec.source.endpoint,
            broker = %self.spec.sink.broker_url,
            "Transfer running"
        );

        let (tx, rx) = mpsc::channel(self.ctx.config.channel_capacity.max(1));
        let (pressure_tx, pressure_rx) = watch::channel(false);
        let mut pump = SinkPump {
            transfer_id: self.spec.id.clone(),
            rx,
            receiving: true,
            stash: None,
            deliveries: FuturesUnordered::new(),
            backpressure_since: None,
            backpressure: pressure_tx,
            window: self.ctx.config.backpressure_window,
            metrics: self.ctx.metrics.clone(),
        };

        let outcome = {
            let gate = Gate {
                control: self.control.clone(),
                sink: sink_monitor.subscribe(),
            };
            let supervisor = Supervisor {
                transfer_id: &self.spec.id,
                status: &self.status,
                metrics: &self.ctx.metrics,
                control: self.control.clone(),
                source: &source_monitor,
                sink: &sink_monitor,
                pressure: pressure_rx,
            };
            tokio::select! {
                outcome = consume(&mut source, &tx, gate, &self.spec, &self.ctx.metrics) => outcome,
                outcome = pump.run(&sink, true) => outcome,
                outcome = supervisor.run() => outcome,
            }
        };

        match outcome {
            Outcome::Terminate => {
                self.status.set(Status::Completing, None).await;
                source.close().await;
                self.stopped.send_replace(true);
                drop(tx);
                let detail = self.drain(&mut pump, &mut sink).await;
                self.status.set(Status::Completed, detail).await;
            }
            Outcome::Failed(failure) => {
                source.close().await;
                self.stopped.send_replace(true);
                drop(tx);
                sink.abort().await;
                self.fail(failure).await;
            }
        }
    }

    /// Flush buffered messages within the drain timeout; returns a warning
    /// when something was left behind
    async fn drain(&self, pump: &mut SinkPump, sink: &mut MqttSink) -> Option<String> {
        let timeout = self.ctx.config.drain_timeout;
        let started = Instant::now();

        let drained = tokio::time::timeout(timeout, pump.run(sink, false)).await;
        let unsent = pump.unsent();
        let remaining = timeout.saturating_sub(started.elapsed());
        let unconfirmed = match sink.close(remaining).await {
            Err(SinkError::FlushTimeout { pending }) => pending,
            _ => 0,
        };

        if drained.is_ok() && unsent + unconfirmed == 0 {
            return None;
        }
        let detail = format!(
            "drain timed out after {:?}; {} messages not delivered",
            timeout,
            unsent + unconfirmed
        );
        warn!(transfer = %self.spec.id, "{}", detail);
        Some(detail)
    }

    async fn fail(&self, failure: Failure) {
        warn!(
            transfer = %self.spec.id,
            leg = %failure.leg,
            kind = failure.kind,
            "Transfer failed: {}",
            failure.error
        );
        self.status.set(Status::Failed, Some(failure.to_string())).await;
    }
}

async fn terminate_requested(control: &mut watch::Receiver<Control>) {
    // A dropped handle counts as terminate
    let _ = control.wait_for(|c| *c == Control::Terminate).await;
}

/// Decides whether the consumer may pull from the source
struct Gate {
    control: watch::Receiver<Control>,
    sink: watch::Receiver<LegStatus>,
}

impl Gate {
    fn is_open(&self) -> bool {
        *self.control.borrow() == Control::Run && !self.sink.borrow().is_degraded()
    }

    async fn wait_until(&mut self, open: bool) {
        while self.is_open() != open {
            let changed = tokio::select! {
                r = self.control.changed() => r.is_ok(),
                r = self.sink.changed() => r.is_ok(),
            };
            if !changed {
                // Handles outlive the consumer; only reachable while shutting down
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Pull, translate and enqueue until the source gives up
async fn consume(
    source: &mut OpcUaValueSource,
    tx: &mpsc::Sender<SinkMessage>,
    mut gate: Gate,
    spec: &TransferSpec,
    metrics: &Metrics,
) -> Outcome {
    loop {
        gate.wait_until(true).await;

        let permit = tokio::select! {
            biased;
            _ = gate.wait_until(false) => continue,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Outcome::Terminate,
            },
        };

        let event = tokio::select! {
            biased;
            _ = gate.wait_until(false) => continue,
            event = source.next_event() => event,
        };

        let dropped = source.take_dropped();
        if dropped > 0 {
            metrics.notifications_dropped(&spec.id, dropped);
        }

        let event = match event {
            Ok(event) => event,
            Err(SourceError::Closed) => return Outcome::Terminate,
            Err(error) => {
                let monitor = source.monitor();
                return Outcome::Failed(Failure::source(&error, Some(&*monitor)));
            }
        };
        metrics.event_received(&spec.id);

        match translate(&event, spec) {
            Translation::Message(message) => permit.send(message),
            Translation::Untranslatable { node_id, reason } => {
                warn!(
                    transfer = %spec.id,
                    node = %node_id,
                    "Dropping untranslatable value change: {}",
                    reason
                );
                metrics.untranslatable(&spec.id);
            }
        }
    }
}

type TimedDelivery = BoxFuture<'static, (Result<(), SinkError>, Instant)>;

/// Moves translated messages into the sink
struct SinkPump {
    transfer_id: String,
    rx: mpsc::Receiver<SinkMessage>,
    /// False once the channel is closed and empty
    receiving: bool,
    /// Message refused with backpressure, retried first
    stash: Option<SinkMessage>,
    deliveries: FuturesUnordered<TimedDelivery>,
    backpressure_since: Option<Instant>,
    backpressure: watch::Sender<bool>,
    window: Duration,
    metrics: Arc<Metrics>,
}

impl SinkPump {
    /// Publish until the channel is closed and every delivery settled
    ///
    /// Cancel safe. With `enforce_window` set, backpressure lasting longer
    /// than the window fails the session.
    async fn run(&mut self, sink: &MqttSink, enforce_window: bool) -> Outcome {
        loop {
            if let Some(message) = self.stash.take() {
                if let Err(failure) = self.submit(sink, message, enforce_window) {
                    return Outcome::Failed(failure);
                }
            }

            if !self.receiving && self.stash.is_none() && self.deliveries.is_empty() {
                return Outcome::Terminate;
            }

            tokio::select! {
                message = self.rx.recv(), if self.receiving && self.stash.is_none() => {
                    match message {
                        Some(message) => self.stash = Some(message),
                        None => self.receiving = false,
                    }
                }
                Some((result, started)) = self.deliveries.next(), if !self.deliveries.is_empty() => {
                    if let Err(failure) = self.settle(sink, result, started) {
                        return Outcome::Failed(failure);
                    }
                }
                _ = tokio::time::sleep(BACKPRESSURE_RETRY), if self.stash.is_some() => {}
            }
        }
    }

    fn submit(
        &mut self,
        sink: &MqttSink,
        message: SinkMessage,
        enforce_window: bool,
    ) -> Result<(), Failure> {
        match sink.submit(message.clone()) {
            Ok(delivery) => {
                self.track(delivery);
                if self.backpressure_since.take().is_some() {
                    debug!(transfer = %self.transfer_id, "Sink backpressure relieved");
                    self.backpressure.send_replace(false);
                }
                Ok(())
            }
            Err(SinkError::Backpressure) => {
                self.stash = Some(message);
                let now = Instant::now();
                let since = match self.backpressure_since {
                    Some(since) => since,
                    None => {
                        debug!(transfer = %self.transfer_id, "Sink backpressure");
                        self.metrics.backpressure(&self.transfer_id);
                        self.backpressure.send_replace(true);
                        self.backpressure_since = Some(now);
                        now
                    }
                };
                if enforce_window && now.duration_since(since) > self.window {
                    return Err(Failure::sink(
                        &SinkError::Backpressure,
                        Some(&*sink.monitor()),
                    ));
                }
                Ok(())
            }
            Err(error) => Err(Failure::sink(&error, Some(&*sink.monitor()))),
        }
    }

    fn track(&mut self, delivery: Delivery) {
        let started = Instant::now();
        self.deliveries
            .push(delivery.map(move |result| (result, started)).boxed());
    }

    fn settle(
        &self,
        sink: &MqttSink,
        result: Result<(), SinkError>,
        started: Instant,
    ) -> Result<(), Failure> {
        match result {
            Ok(()) => {
                self.metrics
                    .message_published(&self.transfer_id, started.elapsed());
                Ok(())
            }
            Err(SinkError::PublishRejected { topic, reason }) => {
                warn!(
                    transfer = %self.transfer_id,
                    topic = %topic,
                    reason = %reason,
                    "Publish rejected, message dropped"
                );
                self.metrics.publish_rejected(&self.transfer_id);
                Ok(())
            }
            Err(error @ SinkError::Unavailable { .. }) => {
                Err(Failure::sink(&error, Some(&*sink.monitor())))
            }
            Err(error) => {
                debug!(transfer = %self.transfer_id, error = %error, "Publish not delivered");
                Ok(())
            }
        }
    }

    /// Messages accepted from the source but never handed to the sink
    fn unsent(&self) -> usize {
        usize::from(self.stash.is_some()) + self.rx.len()
    }
}

/// Derives the session status from the legs and the control signal
struct Supervisor<'a> {
    transfer_id: &'a str,
    status: &'a StatusCell,
    metrics: &'a Metrics,
    control: watch::Receiver<Control>,
    source: &'a LegMonitor,
    sink: &'a LegMonitor,
    pressure: watch::Receiver<bool>,
}

impl Supervisor<'_> {
    async fn run(mut self) -> Outcome {
        let mut source_rx = self.source.subscribe();
        let mut sink_rx = self.sink.subscribe();
        let mut reconnecting = [false, false];

        loop {
            let control = *self.control.borrow_and_update();
            if control == Control::Terminate {
                return Outcome::Terminate;
            }
            let legs = [
                (self.source, source_rx.borrow_and_update().clone()),
                (self.sink, sink_rx.borrow_and_update().clone()),
            ];
            let pressured = *self.pressure.borrow_and_update();

            let mut degraded = Vec::new();
            for (i, (monitor, status)) in legs.iter().enumerate() {
                if let LegStatus::Unavailable(reason) = status {
                    return Outcome::Failed(Failure::unavailable(monitor, reason));
                }
                let is_reconnecting = status.is_degraded();
                if is_reconnecting && !reconnecting[i] {
                    self.metrics.reconnect(self.transfer_id, monitor.leg());
                }
                reconnecting[i] = is_reconnecting;
                if is_reconnecting {
                    degraded.push(format!("{} leg reconnecting", monitor.leg()));
                }
            }
            if pressured {
                degraded.push("sink backpressure".to_string());
            }

            if control == Control::Suspend {
                self.status.set(Status::Suspended, None).await;
            } else if degraded.is_empty() {
                self.status.set(Status::Running, None).await;
            } else {
                self.status
                    .set(Status::Degraded, Some(degraded.join(", ")))
                    .await;
            }

            let changed = tokio::select! {
                r = self.control.changed() => r.is_ok(),
                r = source_rx.changed() => r.is_ok(),
                r = sink_rx.changed() => r.is_ok(),
                r = self.pressure.changed() => r.is_ok(),
            };
            if !changed {
                return Outcome::Terminate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn failure_detail_names_leg_kind_and_activity() {
        let failure = Failure {
            leg: Leg::Sink,
            kind: "Unavailable",
            error: "MQTT broker unavailable after 5 attempts: connection refused".into(),
            last_activity: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
        };
        assert_eq!(
            failure.to_string(),
            "sink leg Unavailable: MQTT broker unavailable after 5 attempts: \
             connection refused; last successful activity 2024-03-01T12:00:00.000Z"
        );

        let never = Failure {
            last_activity: None,
            ..failure
        };
        assert!(never.to_string().ends_with("last successful activity never"));
    }

    #[tokio::test]
    async fn gate_closes_on_suspend_and_sink_reconnect() {
        let (control, control_rx) = watch::channel(Control::Run);
        let sink = LegMonitor::new(Leg::Sink);
        sink.set_status(LegStatus::Up);
        let gate = Gate {
            control: control_rx,
            sink: sink.subscribe(),
        };
        assert!(gate.is_open());

        control.send_replace(Control::Suspend);
        assert!(!gate.is_open());
        control.send_replace(Control::Run);

        sink.set_status(LegStatus::Reconnecting { failures: 1 });
        assert!(!gate.is_open());
        sink.set_status(LegStatus::Up);
        assert!(gate.is_open());
    }
}
