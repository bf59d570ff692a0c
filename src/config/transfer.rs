//! Transfer descriptions
//!
//! A `TransferSpec` names one OPC UA source and one MQTT sink for the lifetime
//! of a transfer process. Specs come from `[[transfer]]` configuration entries
//! or from the orchestration layer, and are never mutated once a session owns
//! them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{ProtocolVersion, QoS};
use crate::source::NodeId;
use crate::topic::TopicTemplate;

/// Namespace prefix the orchestrator may put on data address properties
pub const EDC_NAMESPACE: &str = "https://w3id.org/edc/v0.0.1/ns/";

/// Invalid transfer description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecError {
    pub field: String,
    pub reason: String,
}

impl SpecError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for SpecError {}

/// OPC UA security policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SecurityPolicy {
    #[default]
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    #[serde(rename = "Aes128Sha256RsaOaep", alias = "Aes128_Sha256_RsaOaep")]
    Aes128Sha256RsaOaep,
    #[serde(rename = "Aes256Sha256RsaPss", alias = "Aes256_Sha256_RsaPss")]
    Aes256Sha256RsaPss,
}

impl SecurityPolicy {
    pub fn uri(&self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Basic128Rsa15 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15"
            }
            SecurityPolicy::Basic256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256",
            SecurityPolicy::Basic256Sha256 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
            }
            SecurityPolicy::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
            SecurityPolicy::Aes256Sha256RsaPss => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss"
            }
        }
    }
}

/// OPC UA message security mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// A node to monitor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawNodeSpec")]
pub struct NodeSpec {
    pub node_id: NodeId,
    /// Requested sampling interval; `None` asks for the server minimum
    pub sampling_interval: Option<Duration>,
}

impl NodeSpec {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            sampling_interval: None,
        }
    }

    pub fn with_interval(node_id: NodeId, interval: Duration) -> Self {
        Self {
            node_id,
            sampling_interval: Some(interval),
        }
    }
}

/// Nodes are written either as a bare id or as a table
#[derive(Deserialize)]
#[serde(untagged)]
enum RawNodeSpec {
    Id(NodeId),
    Detailed {
        node_id: NodeId,
        #[serde(default, with = "humantime_serde")]
        sampling_interval: Option<Duration>,
    },
}

impl From<RawNodeSpec> for NodeSpec {
    fn from(raw: RawNodeSpec) -> Self {
        match raw {
            RawNodeSpec::Id(node_id) => NodeSpec::new(node_id),
            RawNodeSpec::Detailed {
                node_id,
                sampling_interval,
            } => NodeSpec {
                node_id,
                sampling_interval,
            },
        }
    }
}

/// OPC UA side of a transfer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceSpec {
    /// `opc.tcp://host:port/path`
    pub endpoint: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub security_policy: SecurityPolicy,
    #[serde(default)]
    pub security_mode: SecurityMode,
    /// Credentials reference; anonymous when absent
    #[serde(default)]
    pub credentials: Option<String>,
}

/// MQTT broker host and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub const DEFAULT_PORT: u16 = 1883;

    /// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` or `host`
    pub fn parse(url: &str) -> Result<Self, SpecError> {
        let invalid = |reason: &str| SpecError::new("sink.broker_url", reason);

        let rest = match url.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => rest,
            Some((scheme, _)) => {
                return Err(invalid(&format!("unsupported scheme '{}'", scheme)));
            }
            None => url,
        };
        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(invalid("missing host"));
        }

        // IPv6 literals must be bracketed: [::1]:1883
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
                (host, tail.strip_prefix(':'))
            }
            None => match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            },
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| invalid(&format!("invalid port '{}'", p)))?,
            None => Self::DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// MQTT side of a transfer
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SinkSpec {
    pub broker_url: String,
    /// Topic template; `{node}`, `{transfer}` and `{asset}` are substituted
    pub topic: TopicTemplate,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    /// Credentials reference; anonymous when absent
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    /// Defaults to `uabridge-<transfer id>`
    #[serde(default)]
    pub client_id: Option<String>,
    /// Discard the broker session on reconnect
    ///
    /// Off by default: reconnects resume the session so retransmitted QoS 1
    /// and 2 publishes are deduplicated by the broker.
    #[serde(default)]
    pub clean_start: bool,
}

impl SinkSpec {
    pub fn broker_address(&self) -> Result<BrokerAddress, SpecError> {
        BrokerAddress::parse(&self.broker_url)
    }
}

/// Immutable description of one bridge instance
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferSpec {
    /// Transfer-process id assigned by the orchestrator
    pub id: String,
    /// Asset being transferred, used by the `{asset}` placeholder
    #[serde(default)]
    pub asset_id: Option<String>,
    pub source: SourceSpec,
    pub sink: SinkSpec,
}

impl TransferSpec {
    /// Build a spec from the property map of an OPC UA data address
    ///
    /// Recognised keys (optionally prefixed with [`EDC_NAMESPACE`]):
    /// `serverUrl`, `nodeId`, `nodeIds` (comma separated), `pushInterval`
    /// (milliseconds, applied as sampling interval) and `assetId`.
    pub fn from_data_address(
        transfer_id: &str,
        properties: &HashMap<String, String>,
        sink: SinkSpec,
    ) -> Result<Self, SpecError> {
        let get = |key: &str| {
            properties
                .get(key)
                .or_else(|| properties.get(&format!("{}{}", EDC_NAMESPACE, key)))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let endpoint = get("serverUrl")
            .ok_or_else(|| SpecError::new("serverUrl", "missing property"))?
            .to_string();

        let interval = get("pushInterval")
            .map(|ms| {
                ms.parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|_| SpecError::new("pushInterval", "expected milliseconds"))
            })
            .transpose()?;

        let raw_nodes = get("nodeIds")
            .or_else(|| get("nodeId"))
            .ok_or_else(|| SpecError::new("nodeIds", "missing property"))?;
        let nodes = raw_nodes
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|n| {
                let node_id = n
                    .parse::<NodeId>()
                    .map_err(|e| SpecError::new("nodeIds", e.to_string()))?;
                Ok(NodeSpec {
                    node_id,
                    sampling_interval: interval,
                })
            })
            .collect::<Result<Vec<_>, SpecError>>()?;

        let spec = Self {
            id: transfer_id.to_string(),
            asset_id: get("assetId").map(str::to_string),
            source: SourceSpec {
                endpoint,
                nodes,
                security_policy: SecurityPolicy::None,
                security_mode: SecurityMode::None,
                credentials: None,
            },
            sink,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// MQTT client identifier for this transfer
    pub fn client_id(&self) -> String {
        self.sink
            .client_id
            .clone()
            .unwrap_or_else(|| format!("uabridge-{}", self.id))
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.trim().is_empty() {
            return Err(SpecError::new("id", "transfer id cannot be empty"));
        }

        let endpoint = &self.source.endpoint;
        if !endpoint.starts_with("opc.tcp://") || endpoint.len() <= "opc.tcp://".len() {
            return Err(SpecError::new(
                "source.endpoint",
                format!("expected opc.tcp:// URL, got '{}'", endpoint),
            ));
        }

        if self.source.nodes.is_empty() {
            return Err(SpecError::new("source.nodes", "at least one node is required"));
        }
        let mut seen = HashSet::new();
        for node in &self.source.nodes {
            if !seen.insert(&node.node_id) {
                return Err(SpecError::new(
                    "source.nodes",
                    format!("node {} listed twice", node.node_id),
                ));
            }
        }

        let secured_policy = self.source.security_policy != SecurityPolicy::None;
        let secured_mode = self.source.security_mode != SecurityMode::None;
        if secured_policy != secured_mode {
            return Err(SpecError::new(
                "source.security_mode",
                "security policy and mode must both be None or both be set",
            ));
        }

        self.sink.broker_address()?;

        let client_id = self.client_id();
        if client_id.is_empty() || client_id.len() > 65535 {
            return Err(SpecError::new("sink.client_id", "invalid length"));
        }

        Ok(())
    }
}
