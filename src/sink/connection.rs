//! MQTT connection task
//!
//! Owns the socket. Reads publish commands only while the in-flight window
//! has room, so a slow or disconnected broker fills the bounded command
//! channel and the sink reports backpressure to its caller.
//!
//! The first connect always starts a clean broker session, since packet ids
//! left over from an earlier process would collide with ours. Reconnects
//! resume the session unless the spec asks for a clean start; when the
//! broker answers without a session, unacknowledged publishes are sent again
//! as new messages and releases still pending are treated as delivered.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{Command, SinkError, SinkOptions};
use crate::backoff::Backoff;
use crate::codec::{Decoder, Encoder};
use crate::config::{BackoffConfig, BrokerAddress, TransferSpec};
use crate::credentials::{Credential, CredentialError, CredentialResolver};
use crate::leg::{LegMonitor, LegStatus};
use crate::protocol::{
    Ack, Connect, Disconnect, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
};
use crate::translate::SinkMessage;

/// Seconds a v5 broker keeps a resumable session after the connection drops
const SESSION_EXPIRY: u32 = 3600;

/// Connection settings resolved from the transfer spec
#[derive(Debug, Clone)]
pub(super) struct ConnectionParams {
    pub transfer_id: String,
    pub address: BrokerAddress,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub credentials: Option<String>,
    pub connect_timeout: Duration,
    pub max_inflight: u16,
    pub keep_alive: u16,
}

impl ConnectionParams {
    pub fn from_spec(spec: &TransferSpec, address: BrokerAddress, options: &SinkOptions) -> Self {
        Self {
            transfer_id: spec.id.clone(),
            address,
            client_id: spec.client_id(),
            protocol_version: spec.sink.protocol_version,
            clean_start: spec.sink.clean_start,
            credentials: spec.sink.credentials.clone(),
            connect_timeout: options.connect_timeout,
            max_inflight: options.max_inflight.max(1),
            keep_alive: options.keep_alive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// QoS 1, waiting for PUBACK
    AwaitAck,
    /// QoS 2, waiting for PUBREC
    AwaitRec,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    AwaitComp,
}

struct Inflight {
    publish: Publish,
    stage: Stage,
    done: oneshot::Sender<Result<(), SinkError>>,
}

enum Exit {
    Closed,
    Lost(String),
}

/// Framed socket halves
struct Link {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Link {
    fn new(stream: TcpStream, version: ProtocolVersion) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            encoder: Encoder::new(version),
            decoder: Decoder::new().with_protocol_version(version),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), String> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| format!("encode error: {}", e))?;
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(|e| e.to_string())
    }

    /// Next complete packet; cancel safe
    async fn read_packet(&mut self) -> Result<Packet, String> {
        loop {
            if let Some((packet, used)) = self
                .decoder
                .decode(&self.read_buf)
                .map_err(|e| format!("decode error: {}", e))?
            {
                self.read_buf.advance(used);
                return Ok(packet);
            }
            let n = self
                .reader
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| e.to_string())?;
            if n == 0 {
                return Err("connection closed by broker".to_string());
            }
        }
    }
}

pub(super) struct Connection {
    params: ConnectionParams,
    resolver: Arc<dyn CredentialResolver>,
    backoff: Backoff,
    commands: mpsc::Receiver<Command>,
    abort: watch::Receiver<bool>,
    pending: Arc<AtomicUsize>,
    monitor: Arc<LegMonitor>,
    failure: Arc<Mutex<Option<SinkError>>>,
    inflight: BTreeMap<u16, Inflight>,
    next_packet_id: u16,
    closing: Option<oneshot::Sender<()>>,
    /// Set after the first successful connect
    connected_once: bool,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ConnectionParams,
        resolver: Arc<dyn CredentialResolver>,
        backoff: BackoffConfig,
        commands: mpsc::Receiver<Command>,
        abort: watch::Receiver<bool>,
        pending: Arc<AtomicUsize>,
        monitor: Arc<LegMonitor>,
        failure: Arc<Mutex<Option<SinkError>>>,
    ) -> Self {
        Self {
            params,
            resolver,
            backoff: Backoff::new(backoff),
            commands,
            abort,
            pending,
            monitor,
            failure,
            inflight: BTreeMap::new(),
            next_packet_id: 1,
            closing: None,
            connected_once: false,
        }
    }

    /// Connection loop; `ready` receives the outcome of the first connect
    pub async fn run(mut self, ready: oneshot::Sender<Result<(), SinkError>>) {
        let mut ready = Some(ready);
        loop {
            let (link, session_present) = match self.establish().await {
                Ok(established) => established,
                Err(error) => {
                    if let SinkError::Unavailable { .. } = error {
                        self.monitor
                            .set_status(LegStatus::Unavailable(error.to_string()));
                        *self.failure.lock() = Some(error.clone());
                    }
                    self.fail_all(&error);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(error));
                    }
                    return;
                }
            };
            if let Some(ready) = ready.take() {
                let _ = ready.send(Ok(()));
            }

            match self.serve(link, session_present).await {
                Exit::Closed => {
                    self.fail_all(&SinkError::Closed);
                    info!(
                        transfer = %self.params.transfer_id,
                        broker = %self.params.address,
                        "MQTT connection closed"
                    );
                    return;
                }
                Exit::Lost(reason) => {
                    warn!(
                        transfer = %self.params.transfer_id,
                        broker = %self.params.address,
                        inflight = self.inflight.len(),
                        "MQTT connection lost: {}",
                        reason
                    );
                    self.monitor
                        .set_status(LegStatus::Reconnecting { failures: 0 });
                }
            }
        }
    }

    fn aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Connect until success, abort, or the failure budget is spent
    async fn establish(&mut self) -> Result<(Link, bool), SinkError> {
        loop {
            if self.aborted() {
                return Err(SinkError::Closed);
            }

            let attempt = tokio::time::timeout(self.params.connect_timeout, self.connect_once());
            let error = match attempt.await {
                Ok(Ok((link, session_present))) => {
                    self.backoff.reset();
                    self.connected_once = true;
                    self.monitor.set_status(LegStatus::Up);
                    info!(
                        transfer = %self.params.transfer_id,
                        broker = %self.params.address,
                        client_id = %self.params.client_id,
                        session_present,
                        "MQTT connected"
                    );
                    return Ok((link, session_present));
                }
                Ok(Err(e)) => e,
                Err(_) => SinkError::ConnectFailed(format!(
                    "timed out after {:?}",
                    self.params.connect_timeout
                )),
            };

            let Some(delay) = self.backoff.next_delay() else {
                return Err(SinkError::Unavailable {
                    attempts: self.backoff.failures(),
                    last_error: error.to_string(),
                });
            };
            warn!(
                transfer = %self.params.transfer_id,
                error = %error,
                retry_in = ?delay,
                "MQTT connection attempt failed"
            );
            self.monitor.set_status(LegStatus::Reconnecting {
                failures: self.backoff.failures(),
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.abort.changed() => return Err(SinkError::Closed),
            }
        }
    }

    /// One connect attempt; returns the link and whether the broker resumed
    /// an existing session
    async fn connect_once(&self) -> Result<(Link, bool), SinkError> {
        let (username, password) = self.auth().await?;

        let address = &self.params.address;
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|e| SinkError::ConnectFailed(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        let mut link = Link::new(stream, self.params.protocol_version);

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: self.params.protocol_version,
            client_id: self.params.client_id.clone(),
            clean_start: self.params.clean_start || !self.connected_once,
            keep_alive: self.params.keep_alive,
            session_expiry_interval: (!self.params.clean_start).then_some(SESSION_EXPIRY),
            username,
            password,
        }));
        link.send(&connect).await.map_err(SinkError::ConnectFailed)?;

        match link.read_packet().await.map_err(SinkError::ConnectFailed)? {
            Packet::ConnAck(ack) if ack.reason_code.is_success() => {
                debug!(
                    transfer = %self.params.transfer_id,
                    session_present = ack.session_present,
                    "CONNACK received"
                );
                Ok((link, ack.session_present))
            }
            Packet::ConnAck(ack) => Err(SinkError::ConnectFailed(format!(
                "broker refused connection: {}",
                ack.reason_code
            ))),
            other => Err(SinkError::ConnectFailed(format!(
                "expected CONNACK, got packet type {}",
                other.packet_type()
            ))),
        }
    }

    /// Credentials are resolved per connection and dropped with it
    async fn auth(&self) -> Result<(Option<String>, Option<Bytes>), SinkError> {
        let Some(reference) = &self.params.credentials else {
            return Ok((None, None));
        };
        match self.resolver.resolve(reference).await {
            Ok(Credential::UserPassword { username, password }) => Ok((
                Some(username),
                Some(Bytes::copy_from_slice(password.expose().as_bytes())),
            )),
            Ok(Credential::Certificate { .. }) => Err(SinkError::ConnectFailed(
                CredentialError::Unsupported {
                    reference: reference.clone(),
                    leg: "MQTT",
                }
                .to_string(),
            )),
            Err(e) => Err(SinkError::ConnectFailed(e.to_string())),
        }
    }

    async fn serve(&mut self, mut link: Link, session_present: bool) -> Exit {
        // Unacknowledged publishes from the previous connection go first
        let resend = self.resume(session_present);
        for packet in &resend {
            if let Err(e) = link.send(packet).await {
                return Exit::Lost(e);
            }
        }
        if !resend.is_empty() {
            debug!(
                transfer = %self.params.transfer_id,
                count = resend.len(),
                session_present,
                "Retransmitted unacknowledged publishes"
            );
        }

        let keep_alive = Duration::from_secs(u64::from(self.params.keep_alive.max(1)));
        let mut ping = tokio::time::interval(keep_alive);
        ping.reset();
        let mut awaiting_pong = false;

        loop {
            if self.aborted() {
                return self.disconnect(&mut link).await;
            }
            if self.closing.is_some() && self.inflight.is_empty() {
                return self.disconnect(&mut link).await;
            }

            let window_open = self.inflight.len() < usize::from(self.params.max_inflight);
            let accepting = window_open && self.closing.is_none();

            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Publish { message, done }) => {
                        if let Err(e) = self.publish(&mut link, message, done).await {
                            return Exit::Lost(e);
                        }
                    }
                    Some(Command::Close { done }) => {
                        debug!(
                            transfer = %self.params.transfer_id,
                            inflight = self.inflight.len(),
                            "Flushing before disconnect"
                        );
                        self.closing = Some(done);
                    }
                    // Sink handle dropped without close
                    None => return self.disconnect(&mut link).await,
                },

                packet = link.read_packet() => match packet {
                    Ok(packet) => {
                        if let Err(e) = self.handle_packet(&mut link, packet, &mut awaiting_pong).await {
                            return Exit::Lost(e);
                        }
                    }
                    Err(e) => return Exit::Lost(e),
                },

                _ = ping.tick(), if self.params.keep_alive > 0 => {
                    if awaiting_pong {
                        return Exit::Lost("keep alive timeout".to_string());
                    }
                    if let Err(e) = link.send(&Packet::PingReq).await {
                        return Exit::Lost(e);
                    }
                    awaiting_pong = true;
                }

                _ = self.abort.changed() => return self.disconnect(&mut link).await,
            }
        }
    }

    /// Packets to resend on a new connection
    ///
    /// A resumed session gets DUP publishes and repeated releases. Without
    /// one the broker has forgotten every packet id: publishes go out as new
    /// messages, and a publish whose PUBREC arrived was already accepted, so
    /// it resolves as delivered.
    fn resume(&mut self, session_present: bool) -> Vec<Packet> {
        if !session_present {
            let released: Vec<u16> = self
                .inflight
                .iter()
                .filter(|(_, entry)| entry.stage == Stage::AwaitComp)
                .map(|(id, _)| *id)
                .collect();
            for id in released {
                if let Some(entry) = self.inflight.remove(&id) {
                    self.resolve(entry.done, Ok(()));
                }
            }
        }

        self.inflight
            .iter_mut()
            .map(|(id, entry)| match entry.stage {
                Stage::AwaitAck | Stage::AwaitRec => {
                    entry.publish.dup = session_present;
                    Packet::Publish(entry.publish.clone())
                }
                Stage::AwaitComp => Packet::PubRel(Ack::new(*id)),
            })
            .collect()
    }

    async fn publish(
        &mut self,
        link: &mut Link,
        message: SinkMessage,
        done: oneshot::Sender<Result<(), SinkError>>,
    ) -> Result<(), String> {
        let SinkMessage {
            topic,
            payload,
            qos,
            retain,
        } = message;

        if qos == QoS::AtMostOnce {
            let publish = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic,
                packet_id: None,
                payload,
            });
            return match link.send(&publish).await {
                Ok(()) => {
                    self.resolve(done, Ok(()));
                    Ok(())
                }
                Err(e) => {
                    self.resolve(done, Err(SinkError::ConnectFailed(e.clone())));
                    Err(e)
                }
            };
        }

        let packet_id = self.allocate_packet_id();
        let publish = Publish {
            dup: false,
            qos,
            retain,
            topic,
            packet_id: Some(packet_id),
            payload,
        };
        let packet = Packet::Publish(publish.clone());
        let stage = if qos == QoS::AtLeastOnce {
            Stage::AwaitAck
        } else {
            Stage::AwaitRec
        };
        // Tracked before the write so a failed write is retransmitted
        self.inflight.insert(
            packet_id,
            Inflight {
                publish,
                stage,
                done,
            },
        );
        link.send(&packet).await
    }

    async fn handle_packet(
        &mut self,
        link: &mut Link,
        packet: Packet,
        awaiting_pong: &mut bool,
    ) -> Result<(), String> {
        match packet {
            Packet::PubAck(ack) => {
                if let Some(entry) = self.take_inflight(ack.packet_id, Stage::AwaitAck) {
                    self.complete(entry, ack.reason_code);
                }
            }
            Packet::PubRec(ack) => {
                let Some(entry) = self.inflight.get_mut(&ack.packet_id) else {
                    debug!(packet_id = ack.packet_id, "PUBREC for unknown packet id");
                    return Ok(());
                };
                if ack.reason_code.is_error() {
                    if let Some(entry) = self.inflight.remove(&ack.packet_id) {
                        self.complete(entry, ack.reason_code);
                    }
                    return Ok(());
                }
                entry.stage = Stage::AwaitComp;
                link.send(&Packet::PubRel(Ack::new(ack.packet_id))).await?;
            }
            Packet::PubComp(ack) => {
                if let Some(entry) = self.take_inflight(ack.packet_id, Stage::AwaitComp) {
                    // The broker released the id before we asked again
                    let reason = if ack.reason_code == ReasonCode::PACKET_ID_NOT_FOUND {
                        ReasonCode::SUCCESS
                    } else {
                        ack.reason_code
                    };
                    self.complete(entry, reason);
                }
            }
            Packet::PingResp => *awaiting_pong = false,
            Packet::Disconnect(disconnect) => {
                return Err(format!(
                    "broker sent DISCONNECT: {}",
                    disconnect.reason_code
                ));
            }
            other => {
                debug!(
                    transfer = %self.params.transfer_id,
                    packet_type = other.packet_type(),
                    "Ignoring unexpected packet"
                );
            }
        }
        Ok(())
    }

    fn take_inflight(&mut self, packet_id: u16, stage: Stage) -> Option<Inflight> {
        match self.inflight.get(&packet_id) {
            Some(entry) if entry.stage == stage => self.inflight.remove(&packet_id),
            Some(entry) => {
                debug!(packet_id, stage = ?entry.stage, "Acknowledgement out of sequence");
                None
            }
            None => {
                debug!(packet_id, "Acknowledgement for unknown packet id");
                None
            }
        }
    }

    fn complete(&self, entry: Inflight, reason: ReasonCode) {
        if reason.is_error() {
            warn!(
                transfer = %self.params.transfer_id,
                topic = %entry.publish.topic,
                reason = %reason,
                "Broker rejected publish"
            );
            let topic = entry.publish.topic;
            self.resolve(entry.done, Err(SinkError::PublishRejected { topic, reason }));
        } else {
            self.resolve(entry.done, Ok(()));
        }
    }

    fn resolve(&self, done: oneshot::Sender<Result<(), SinkError>>, result: Result<(), SinkError>) {
        if result.is_ok() {
            self.monitor.touch();
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        let _ = done.send(result);
    }

    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            if !self.inflight.contains_key(&id) {
                return id;
            }
        }
    }

    async fn disconnect(&mut self, link: &mut Link) -> Exit {
        let _ = link
            .send(&Packet::Disconnect(Disconnect {
                reason_code: ReasonCode::SUCCESS,
            }))
            .await;
        let _ = link.writer.shutdown().await;
        if let Some(done) = self.closing.take() {
            let _ = done.send(());
        }
        self.monitor.set_status(LegStatus::Closed);
        Exit::Closed
    }

    /// Resolve everything still queued or in flight with `error`
    fn fail_all(&mut self, error: &SinkError) {
        for (_, entry) in std::mem::take(&mut self.inflight) {
            self.resolve(entry.done, Err(error.clone()));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Publish { done, .. } => self.resolve(done, Err(error.clone())),
                Command::Close { done } => {
                    let _ = done.send(());
                }
            }
        }
        if let Some(done) = self.closing.take() {
            let _ = done.send(());
        }
    }
}
