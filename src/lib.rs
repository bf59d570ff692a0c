//! uabridge - OPC UA to MQTT data-plane bridge
//!
//! Moves live values from OPC UA monitored items to an MQTT broker for the
//! lifetime of a transfer process, reconnecting each leg independently and
//! reporting transfer status to the orchestration layer.

pub mod backoff;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod leg;
pub mod metrics;
pub mod protocol;
pub mod sink;
pub mod source;
pub mod topic;
pub mod translate;
pub mod value;

pub use bridge::{BridgeRegistry, RegistryError, SessionContext, Status, StatusReporter};
pub use config::{Config, TransferSpec};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::{ProtocolVersion, QoS};
pub use sink::{MqttSink, SinkError};
pub use source::{OpcUaValueSource, SourceError};
pub use translate::{translate, SinkMessage, Translation};
pub use value::{Quality, Value, ValueChangeEvent};
