//! Credential resolution
//!
//! Transfers name their credentials by reference. References are resolved
//! each time a leg opens a connection and the material is dropped together
//! with that connection.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

/// A string that never appears in logs
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Credential material
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// OPC UA user identity token or MQTT username/password
    UserPassword { username: String, password: Secret },
    /// OPC UA X.509 user identity (PEM/DER paths)
    Certificate { cert_path: String, key_path: String },
}

/// Credential resolution failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    NotFound(String),
    /// The material exists but cannot be used on this leg
    Unsupported { reference: String, leg: &'static str },
    Backend(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(r) => write!(f, "credentials '{}' not found", r),
            Self::Unsupported { reference, leg } => {
                write!(f, "credentials '{}' cannot be used for {}", reference, leg)
            }
            Self::Backend(msg) => write!(f, "credential backend error: {}", msg),
        }
    }
}

impl std::error::Error for CredentialError {}

/// Resolves credential references to material
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<Credential, CredentialError>;
}

/// Resolver backed by the `[credentials]` configuration table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new(entries: HashMap<String, Credential>) -> Self {
        Self { entries }
    }

    pub fn with(mut self, reference: impl Into<String>, credential: Credential) -> Self {
        self.entries.insert(reference.into(), credential);
        self
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.entries.contains_key(reference)
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, reference: &str) -> Result<Credential, CredentialError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_configured_entries() {
        let resolver = StaticCredentials::default().with(
            "broker",
            Credential::UserPassword {
                username: "edc".to_string(),
                password: Secret::new("s3cret"),
            },
        );

        match resolver.resolve("broker").await.unwrap() {
            Credential::UserPassword { username, password } => {
                assert_eq!(username, "edc");
                assert_eq!(password.expose(), "s3cret");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            resolver.resolve("missing").await,
            Err(CredentialError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn secrets_are_redacted() {
        let credential = Credential::UserPassword {
            username: "edc".to_string(),
            password: Secret::new("s3cret"),
        };
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("edc"));
    }
}
