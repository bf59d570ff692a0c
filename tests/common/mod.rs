//! Test helpers: an in-process MQTT broker speaking the crate's codec
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use uabridge::codec::{Decoder, Encoder};
use uabridge::config::{BackoffConfig, NodeSpec, SinkSpec, SourceSpec, TransferSpec};
use uabridge::protocol::{
    Ack, ConnAck, Connect, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
};
use uabridge::source::NodeId;

struct State {
    connects: Vec<Connect>,
    publishes: Vec<Publish>,
    releases: usize,
    refuse: Option<ReasonCode>,
    withhold_acks: bool,
    /// Close the connection when this many publishes have been received
    drop_at: Option<usize>,
    /// Close the connection when this many releases have been received
    drop_release_at: Option<usize>,
    rejected_topics: Vec<(String, ReasonCode)>,
    /// Client ids with a session on the broker
    sessions: HashSet<String>,
    keep_sessions: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connects: Vec::new(),
            publishes: Vec::new(),
            releases: 0,
            refuse: None,
            withhold_acks: false,
            drop_at: None,
            drop_release_at: None,
            rejected_topics: Vec::new(),
            sessions: HashSet::new(),
            keep_sessions: true,
        }
    }
}

/// Minimal MQTT broker: accepts clients, records publishes, acknowledges
/// according to the configured behaviour
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Answer CONNECT with this error code
    pub fn refuse_with(&self, code: ReasonCode) {
        self.state.lock().refuse = Some(code);
    }

    /// Accept connections again after `refuse_with`
    pub fn accept(&self) {
        self.state.lock().refuse = None;
    }

    /// Lose all client sessions, as a broker restart without persistence
    /// would, and never resume one from now on
    pub fn forget_sessions(&self) {
        let mut state = self.state.lock();
        state.keep_sessions = false;
        state.sessions.clear();
    }

    pub fn withhold_acks(&self, withhold: bool) {
        self.state.lock().withhold_acks = withhold;
    }

    /// Drop the connection, unacknowledged, on the n-th publish
    pub fn drop_at(&self, n: usize) {
        self.state.lock().drop_at = Some(n);
    }

    /// Drop the connection, uncompleted, on the n-th release
    pub fn drop_release_at(&self, n: usize) {
        self.state.lock().drop_release_at = Some(n);
    }

    /// Acknowledge publishes to `topic` with an error reason code (v5)
    pub fn reject_topic(&self, topic: &str, code: ReasonCode) {
        self.state
            .lock()
            .rejected_topics
            .push((topic.to_string(), code));
    }

    pub fn publishes(&self) -> Vec<Publish> {
        self.state.lock().publishes.clone()
    }

    pub fn connects(&self) -> Vec<Connect> {
        self.state.lock().connects.clone()
    }

    pub fn releases(&self) -> usize {
        self.state.lock().releases
    }

    pub async fn wait_for_publishes(&self, n: usize) -> Vec<Publish> {
        eventually("publishes", || self.publishes().len() >= n).await;
        self.publishes()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Reply {
    Send(Packet),
    /// Send, then hang up
    Refuse(Packet),
    Hangup,
    Nothing,
}

fn respond(state: &Mutex<State>, packet: Packet) -> Reply {
    let mut state = state.lock();
    match packet {
        Packet::Connect(connect) => {
            let refuse = state.refuse;
            let session_present = state.keep_sessions
                && !connect.clean_start
                && state.sessions.contains(&connect.client_id);
            let client_id = connect.client_id.clone();
            state.connects.push(*connect);
            match refuse {
                Some(code) => Reply::Refuse(Packet::ConnAck(ConnAck {
                    session_present: false,
                    reason_code: code,
                })),
                None => {
                    if state.keep_sessions {
                        state.sessions.insert(client_id);
                    }
                    Reply::Send(Packet::ConnAck(ConnAck {
                        session_present,
                        reason_code: ReasonCode::SUCCESS,
                    }))
                }
            }
        }
        Packet::Publish(publish) => {
            let qos = publish.qos;
            let packet_id = publish.packet_id.unwrap_or(0);
            let reason_code = state
                .rejected_topics
                .iter()
                .find(|(topic, _)| *topic == publish.topic)
                .map(|(_, code)| *code)
                .unwrap_or(ReasonCode::SUCCESS);
            state.publishes.push(publish);
            if state.drop_at == Some(state.publishes.len()) {
                state.drop_at = None;
                return Reply::Hangup;
            }
            let ack = Ack {
                packet_id,
                reason_code,
            };
            match qos {
                _ if state.withhold_acks => Reply::Nothing,
                QoS::AtMostOnce => Reply::Nothing,
                QoS::AtLeastOnce => Reply::Send(Packet::PubAck(ack)),
                QoS::ExactlyOnce => Reply::Send(Packet::PubRec(ack)),
            }
        }
        Packet::PubRel(ack) => {
            state.releases += 1;
            if state.drop_release_at == Some(state.releases) {
                state.drop_release_at = None;
                return Reply::Hangup;
            }
            if state.withhold_acks {
                Reply::Nothing
            } else {
                Reply::Send(Packet::PubComp(Ack::new(ack.packet_id)))
            }
        }
        Packet::PingReq => Reply::Send(Packet::PingResp),
        Packet::Disconnect(_) => Reply::Hangup,
        _ => Reply::Nothing,
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new(ProtocolVersion::V311);
    let mut buf = BytesMut::with_capacity(4096);
    let mut out = BytesMut::new();

    loop {
        loop {
            let (packet, used) = match decoder.decode(&buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(_) => return,
            };
            buf.advance(used);
            if let Packet::Connect(connect) = &packet {
                encoder = Encoder::new(connect.protocol_version);
            }

            let (reply, hangup) = match respond(&state, packet) {
                Reply::Send(reply) => (Some(reply), false),
                Reply::Refuse(reply) => (Some(reply), true),
                Reply::Hangup => return,
                Reply::Nothing => (None, false),
            };
            if let Some(reply) = reply {
                out.clear();
                encoder.encode(&reply, &mut out).unwrap();
                if stream.write_all(&out).await.is_err() || hangup {
                    return;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Poll `check` every 10ms for up to 10 seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub fn fast_backoff(max_failures: u32) -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        jitter: 0.0,
        max_failures,
    }
}

pub fn temperature() -> NodeId {
    NodeId::string(2, "Temperature")
}

pub fn transfer(id: &str, nodes: Vec<NodeId>, broker_url: &str, qos: QoS) -> TransferSpec {
    TransferSpec {
        id: id.to_string(),
        asset_id: None,
        source: SourceSpec {
            endpoint: "opc.tcp://plc.local:4840".to_string(),
            nodes: nodes.into_iter().map(NodeSpec::new).collect(),
            security_policy: Default::default(),
            security_mode: Default::default(),
            credentials: None,
        },
        sink: SinkSpec {
            broker_url: broker_url.to_string(),
            topic: "plant/{node}".parse().unwrap(),
            qos,
            retain: false,
            credentials: None,
            protocol_version: ProtocolVersion::V311,
            client_id: None,
            clean_start: false,
        },
    }
}
