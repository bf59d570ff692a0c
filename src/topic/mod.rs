//! Topic names for outbound messages
//!
//! Destination topics are produced from a per-transfer template and must be
//! valid MQTT topic names (no wildcards, no null characters).

mod template;
pub mod validation;

pub use template::{TemplateError, TopicContext, TopicTemplate};
pub use validation::validate_topic_name;
