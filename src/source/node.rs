//! OPC UA node identifiers
//!
//! String form is `ns=<namespace>;{i|s|g|b}=<identifier>`, with the namespace
//! omitted for namespace 0.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

/// Identifier part of a node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeIdentifier {
    Numeric(u32),
    String(String),
    Guid(Uuid),
    Opaque(Vec<u8>),
}

/// OPC UA node identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: NodeIdentifier,
}

/// Error parsing a node id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdError {
    pub input: String,
    pub reason: String,
}

impl fmt::Display for NodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for NodeIdError {}

impl NodeId {
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::Numeric(value),
        }
    }

    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: NodeIdentifier::String(value.into()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            NodeIdentifier::Numeric(v) => write!(f, "i={}", v),
            NodeIdentifier::String(v) => write!(f, "s={}", v),
            NodeIdentifier::Guid(v) => write!(f, "g={}", v),
            NodeIdentifier::Opaque(v) => write!(f, "b={}", BASE64.encode(v)),
        }
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: String| NodeIdError {
            input: s.to_string(),
            reason,
        };

        let (namespace, rest) = match s.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, id) = tail
                    .split_once(';')
                    .ok_or_else(|| invalid("missing identifier after namespace".to_string()))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| invalid("invalid namespace index".to_string()))?;
                (ns, id)
            }
            None => (0, s),
        };

        let identifier = if let Some(v) = rest.strip_prefix("i=") {
            NodeIdentifier::Numeric(
                v.parse()
                    .map_err(|_| invalid("invalid numeric identifier".to_string()))?,
            )
        } else if let Some(v) = rest.strip_prefix("s=") {
            if v.is_empty() {
                return Err(invalid("empty string identifier".to_string()));
            }
            NodeIdentifier::String(v.to_string())
        } else if let Some(v) = rest.strip_prefix("g=") {
            NodeIdentifier::Guid(
                Uuid::parse_str(v).map_err(|e| invalid(format!("invalid GUID: {}", e)))?,
            )
        } else if let Some(v) = rest.strip_prefix("b=") {
            NodeIdentifier::Opaque(
                BASE64
                    .decode(v)
                    .map_err(|e| invalid(format!("invalid base64: {}", e)))?,
            )
        } else {
            return Err(invalid("expected i=, s=, g= or b= identifier".to_string()));
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("ns=2;s=Temperature", NodeId::string(2, "Temperature"))]
    #[test_case("ns=2;i=1001", NodeId::numeric(2, 1001))]
    #[test_case("i=2258", NodeId::numeric(0, 2258))]
    #[test_case("ns=3;s=Line1;Motor.Speed", NodeId::string(3, "Line1;Motor.Speed"))]
    fn parses_and_prints_canonical_form(input: &str, expected: NodeId) {
        let parsed: NodeId = input.parse().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), input);
    }

    #[test]
    fn parses_guid_and_opaque() {
        let guid: NodeId = "ns=1;g=550e8400-e29b-41d4-a716-446655440000"
            .parse()
            .unwrap();
        assert!(matches!(guid.identifier, NodeIdentifier::Guid(_)));

        let opaque: NodeId = "ns=1;b=SGVsbG8=".parse().unwrap();
        assert_eq!(opaque.identifier, NodeIdentifier::Opaque(b"Hello".to_vec()));
        assert_eq!(opaque.to_string(), "ns=1;b=SGVsbG8=");
    }

    #[test_case("ns=2" ; "missing identifier")]
    #[test_case("ns=x;i=1" ; "bad namespace")]
    #[test_case("ns=2;i=abc" ; "bad numeric")]
    #[test_case("ns=2;s=" ; "empty string")]
    #[test_case("Temperature" ; "no identifier type")]
    #[test_case("ns=1;g=not-a-guid" ; "bad guid")]
    fn rejects(input: &str) {
        assert!(input.parse::<NodeId>().is_err());
    }
}
