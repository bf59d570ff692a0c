//! OPC UA to MQTT bridging
//!
//! A [`BridgeRegistry`] owns one session per transfer process. Each session
//! wires an [`OpcUaValueSource`](crate::source::OpcUaValueSource) to an
//! [`MqttSink`](crate::sink::MqttSink) through the translator, supervises
//! both legs and reports every status transition.
//!
//! # Example Configuration
//!
//! ```toml
//! [[transfer]]
//! id = "tp-42"
//!
//! [transfer.source]
//! endpoint = "opc.tcp://plc.local:4840"
//! nodes = ["ns=2;s=Temperature", { node_id = "ns=2;s=Pressure", sampling_interval = "250ms" }]
//!
//! [transfer.sink]
//! broker_url = "tcp://broker.local:1883"
//! topic = "plant/{node}"
//! qos = 1
//! ```

mod registry;
mod session;
mod status;


pub use registry::{BridgeRegistry, EndpointReference, RegistryError};
pub use session::SessionContext;
pub use status::{LogReporter, Status, StatusReporter};
