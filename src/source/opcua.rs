//! `opcua` crate backend
//!
//! The 0.12 client API is synchronous, so session establishment and
//! subscription calls run on the blocking pool. Data change callbacks fire on
//! the session's own thread and feed a [`NotificationQueue`]; loss of the
//! connection or server-side session closure marks the queue as lost once
//! the notifications already received have been handed out.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use opcua::client::prelude::{
    ClientBuilder, ConnectionStatusCallback, DataChangeCallback, IdentityToken,
    MonitoredItemService, Session, SessionClosedCallback, SessionCommand, SubscriptionService,
};
use opcua::crypto::SecurityPolicy as UaSecurityPolicy;
use opcua::sync::RwLock;
use opcua::types::{
    AttributeId, ByteString, DataValue, ExtensionObject, Guid, Identifier, MessageSecurityMode,
    MonitoredItemCreateRequest, MonitoringMode, MonitoringParameters, QualifiedName, ReadValueId,
    StatusCode, TimestampsToReturn, UAString, Variant,
};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::queue::{NotificationQueue, NotificationSender};
use super::{
    Identity, NodeId, NodeIdentifier, OpcUaConnector, OpcUaSession, SessionParams, SourceError,
    SubscriptionGroup,
};
use crate::config::{SecurityMode, SecurityPolicy};
use crate::value::{Quality, Value, ValueChangeEvent};

/// Subscription tuning passed to `create_subscription`
const LIFETIME_COUNT: u32 = 60;
const KEEP_ALIVE_COUNT: u32 = 10;
const MONITORED_QUEUE_SIZE: u32 = 10;

/// Connector backed by the `opcua` client
#[derive(Debug, Clone)]
pub struct OpcUaClientConnector {
    application_name: String,
    application_uri: String,
    pki_dir: PathBuf,
    /// Notifications buffered between the callback thread and the source
    queue_capacity: usize,
}

impl OpcUaClientConnector {
    pub fn new(pki_dir: impl Into<PathBuf>, queue_capacity: usize) -> Self {
        Self {
            application_name: "uabridge".to_string(),
            application_uri: "urn:uabridge".to_string(),
            pki_dir: pki_dir.into(),
            queue_capacity: queue_capacity.max(1),
        }
    }
}

#[async_trait]
impl OpcUaConnector for OpcUaClientConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Box<dyn OpcUaSession>, SourceError> {
        let connector = self.clone();
        let blocking_params = params.clone();
        let session = tokio::task::spawn_blocking(move || connector.connect_blocking(&blocking_params))
            .await
            .map_err(|e| SourceError::ConnectFailed(e.to_string()))??;

        let (sender, queue) = NotificationQueue::bounded(self.queue_capacity);
        {
            let mut session = session.write();
            let closed = sender.clone();
            session.set_session_closed_callback(SessionClosedCallback::new(move |status| {
                closed.lose(format!("session closed by server: {}", status));
            }));
            let status = sender.clone();
            session.set_connection_status_callback(ConnectionStatusCallback::new(
                move |connected| {
                    if !connected {
                        status.lose("connection lost");
                    }
                },
            ));
        }

        let stop = Session::run_async(session.clone());

        debug!(endpoint = %params.endpoint, "OPC UA client session running");
        Ok(Box::new(OpcUaClientSession {
            session,
            stop: Some(stop),
            sender,
            queue,
        }))
    }
}

impl OpcUaClientConnector {
    fn connect_blocking(
        &self,
        params: &SessionParams,
    ) -> Result<Arc<RwLock<Session>>, SourceError> {
        let mut client = ClientBuilder::new()
            .application_name(&self.application_name)
            .application_uri(&self.application_uri)
            .pki_dir(&self.pki_dir)
            .trust_server_certs(true)
            .create_sample_keypair(params.security_policy != SecurityPolicy::None)
            // Reconnection is driven by OpcUaValueSource
            .session_retry_limit(0)
            .session_timeout(params.timeout.as_millis().min(u32::MAX as u128) as u32)
            .client()
            .ok_or_else(|| SourceError::ConnectFailed("invalid client configuration".into()))?;

        let endpoints = client
            .get_server_endpoints_from_url(params.endpoint.as_str())
            .map_err(|status| {
                SourceError::ConnectFailed(format!("{}: {}", params.endpoint, status))
            })?;

        let policy = ua_security_policy(params.security_policy);
        let mode = ua_security_mode(params.security_mode);
        let endpoint = endpoints
            .iter()
            .find(|e| e.security_policy_uri.as_ref() == policy.to_uri() && e.security_mode == mode)
            .cloned()
            .ok_or_else(|| {
                SourceError::ConnectFailed(format!(
                    "no endpoint offers {:?}/{:?}",
                    params.security_policy, params.security_mode
                ))
            })?;

        client
            .connect_to_endpoint(endpoint, identity_token(&params.identity))
            .map_err(|status| {
                SourceError::ConnectFailed(format!("{}: {}", params.endpoint, status))
            })
    }
}

struct OpcUaClientSession {
    session: Arc<RwLock<Session>>,
    stop: Option<oneshot::Sender<SessionCommand>>,
    sender: NotificationSender,
    queue: NotificationQueue,
}

#[async_trait]
impl OpcUaSession for OpcUaClientSession {
    async fn create_subscription(
        &mut self,
        group: &SubscriptionGroup,
    ) -> Result<u32, SourceError> {
        let session = self.session.clone();
        let sender = self.sender.clone();
        let group = group.clone();

        tokio::task::spawn_blocking(move || {
            let interval_ms = group
                .sampling_interval
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0);

            let session = session.read();
            let subscription_id = session
                .create_subscription(
                    interval_ms,
                    LIFETIME_COUNT,
                    KEEP_ALIVE_COUNT,
                    0,
                    0,
                    true,
                    DataChangeCallback::new(move |items| {
                        for item in items {
                            let node_id = from_ua_node_id(&item.item_to_monitor().node_id);
                            let event = event_from_data_value(node_id, item.last_value());
                            sender.push(event);
                        }
                    }),
                )
                .map_err(|status| SourceError::SubscriptionFailed(status.to_string()))?;

            let requests: Vec<MonitoredItemCreateRequest> = group
                .nodes
                .iter()
                .enumerate()
                .map(|(handle, node)| MonitoredItemCreateRequest {
                    item_to_monitor: ReadValueId {
                        node_id: to_ua_node_id(node),
                        attribute_id: AttributeId::Value as u32,
                        index_range: UAString::null(),
                        data_encoding: QualifiedName::null(),
                    },
                    monitoring_mode: MonitoringMode::Reporting,
                    requested_parameters: MonitoringParameters {
                        client_handle: handle as u32 + 1,
                        sampling_interval: interval_ms,
                        filter: ExtensionObject::null(),
                        queue_size: MONITORED_QUEUE_SIZE,
                        discard_oldest: true,
                    },
                })
                .collect();

            let results = session
                .create_monitored_items(subscription_id, TimestampsToReturn::Both, &requests)
                .map_err(|status| SourceError::SubscriptionFailed(status.to_string()))?;
            for (node, result) in group.nodes.iter().zip(results.iter()) {
                if !result.status_code.is_good() {
                    return Err(SourceError::SubscriptionFailed(format!(
                        "{}: {}",
                        node, result.status_code
                    )));
                }
            }
            Ok(subscription_id)
        })
        .await
        .map_err(|e| SourceError::SubscriptionFailed(e.to_string()))?
    }

    async fn next_event(&mut self) -> Result<ValueChangeEvent, SourceError> {
        self.queue.next().await
    }

    fn take_dropped(&self) -> u64 {
        self.queue.take_dropped()
    }

    async fn close(&mut self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || session.read().disconnect()).await;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(SessionCommand::Stop);
        }
    }
}

fn ua_security_policy(policy: SecurityPolicy) -> UaSecurityPolicy {
    match policy {
        SecurityPolicy::None => UaSecurityPolicy::None,
        SecurityPolicy::Basic128Rsa15 => UaSecurityPolicy::Basic128Rsa15,
        SecurityPolicy::Basic256 => UaSecurityPolicy::Basic256,
        SecurityPolicy::Basic256Sha256 => UaSecurityPolicy::Basic256Sha256,
        SecurityPolicy::Aes128Sha256RsaOaep => UaSecurityPolicy::Aes128Sha256RsaOaep,
        SecurityPolicy::Aes256Sha256RsaPss => UaSecurityPolicy::Aes256Sha256RsaPss,
    }
}

fn ua_security_mode(mode: SecurityMode) -> MessageSecurityMode {
    match mode {
        SecurityMode::None => MessageSecurityMode::None,
        SecurityMode::Sign => MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

fn identity_token(identity: &Identity) -> IdentityToken {
    match identity {
        Identity::Anonymous => IdentityToken::Anonymous,
        Identity::UserName { username, password } => {
            IdentityToken::UserName(username.clone(), password.expose().to_string())
        }
        Identity::X509 {
            cert_path,
            key_path,
        } => IdentityToken::X509(cert_path.clone(), key_path.clone()),
    }
}

fn to_ua_node_id(node_id: &NodeId) -> opcua::types::NodeId {
    let ns = node_id.namespace;
    match &node_id.identifier {
        NodeIdentifier::Numeric(v) => opcua::types::NodeId::new(ns, *v),
        NodeIdentifier::String(v) => opcua::types::NodeId::new(ns, UAString::from(v.as_str())),
        NodeIdentifier::Guid(v) => opcua::types::NodeId::new(ns, Guid::from(*v)),
        NodeIdentifier::Opaque(v) => {
            opcua::types::NodeId::new(ns, ByteString::from(v.as_slice()))
        }
    }
}

fn from_ua_node_id(node_id: &opcua::types::NodeId) -> NodeId {
    let identifier = match &node_id.identifier {
        Identifier::Numeric(v) => NodeIdentifier::Numeric(*v),
        Identifier::String(v) => NodeIdentifier::String(v.as_ref().to_string()),
        Identifier::Guid(v) => NodeIdentifier::Guid(Uuid::from_bytes(*v.as_bytes())),
        Identifier::ByteString(v) => NodeIdentifier::Opaque(v.value.clone().unwrap_or_default()),
    };
    NodeId {
        namespace: node_id.namespace,
        identifier,
    }
}

fn event_from_data_value(node_id: NodeId, data: &DataValue) -> ValueChangeEvent {
    let status = data.status.unwrap_or(StatusCode::Good);
    let reason = (!status.is_good()).then(|| status.name().to_string());
    ValueChangeEvent {
        node_id,
        value: data
            .value
            .as_ref()
            .map(variant_to_value)
            .unwrap_or_else(|| Value::Unsupported {
                type_name: "Empty".to_string(),
                detail: "notification without value".to_string(),
            }),
        source_timestamp: data.source_timestamp.as_ref().map(|t| t.as_chrono()),
        server_timestamp: data.server_timestamp.as_ref().map(|t| t.as_chrono()),
        quality: Quality::from_status_code(status.bits(), reason),
    }
}

fn variant_to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Boolean(v) => Value::Boolean(*v),
        Variant::SByte(v) => Value::Integer(i64::from(*v)),
        Variant::Byte(v) => Value::Integer(i64::from(*v)),
        Variant::Int16(v) => Value::Integer(i64::from(*v)),
        Variant::UInt16(v) => Value::Integer(i64::from(*v)),
        Variant::Int32(v) => Value::Integer(i64::from(*v)),
        Variant::UInt32(v) => Value::Integer(i64::from(*v)),
        Variant::Int64(v) => Value::Integer(*v),
        Variant::UInt64(v) => match i64::try_from(*v) {
            Ok(v) => Value::Integer(v),
            Err(_) => Value::Unsupported {
                type_name: "UInt64".to_string(),
                detail: format!("{} exceeds the signed 64-bit range", v),
            },
        },
        Variant::Float(v) => Value::Float(f64::from(*v)),
        Variant::Double(v) => Value::Float(*v),
        Variant::String(v) => Value::String(v.as_ref().to_string()),
        Variant::XmlElement(v) => Value::String(v.as_ref().to_string()),
        Variant::LocalizedText(v) => Value::String(v.text.as_ref().to_string()),
        Variant::DateTime(v) => Value::String(v.as_chrono().to_rfc3339()),
        Variant::Guid(v) => Value::String(Uuid::from_bytes(*v.as_bytes()).to_string()),
        Variant::NodeId(v) => Value::String(from_ua_node_id(v).to_string()),
        Variant::ByteString(v) => Value::Bytes(v.value.clone().unwrap_or_default()),
        Variant::Array(array) => Value::from_elements(array.values.iter().map(variant_to_value)),
        other => Value::Unsupported {
            type_name: format!("{:?}", other.type_id()),
            detail: "no mapping for this OPC UA type".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn node_ids_convert_both_ways() {
        for node in [
            NodeId::numeric(2, 1001),
            NodeId::string(2, "Temperature"),
            NodeId {
                namespace: 1,
                identifier: NodeIdentifier::Opaque(b"raw".to_vec()),
            },
        ] {
            assert_eq!(from_ua_node_id(&to_ua_node_id(&node)), node);
        }
    }

    #[test]
    fn variants_map_onto_values() {
        assert_eq!(variant_to_value(&Variant::Int16(-3)), Value::Integer(-3));
        assert_eq!(variant_to_value(&Variant::Double(21.5)), Value::Float(21.5));
        assert_eq!(variant_to_value(&Variant::Boolean(true)), Value::Boolean(true));
        assert!(matches!(
            variant_to_value(&Variant::UInt64(u64::MAX)),
            Value::Unsupported { .. }
        ));
    }
}
