//! Endpoint configuration types
//!
//! An endpoint describes one externally configured AI-serving target: the
//! protocol it speaks, how to reach it, how it authenticates, and how
//! requests and responses are shaped. Endpoint records are created and edited
//! through the admin surface and persisted by the endpoint store; the invoker
//! service only reads them and proposes token-cache updates back to the
//! caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Wire protocol an endpoint speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// One synchronous HTTP request/response cycle
    Rest,
    /// Duplex websocket: one message out, a stream of messages back
    Stream,
    /// Named-function call relayed to a connected SDK client
    Relay,
}

impl ProtocolKind {
    /// Lower-case protocol name as carried in diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Rest => "rest",
            ProtocolKind::Stream => "stream",
            ProtocolKind::Relay => "relay",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared shape of a synchronous response body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Body is parsed as JSON before mapping
    Json,
    /// Body is taken verbatim as the `output` field
    Text,
}

impl Default for ResponseFormat {
    fn default() -> Self {
        Self::Json
    }
}

/// Credentials an endpoint authenticates with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    /// No authentication
    None,
    /// A static bearer token configured on the endpoint
    BearerToken { token: String },
    /// OAuth2 client-credentials exchange against a token endpoint
    ClientCredentials {
        client_id: String,
        client_secret: String,
        token_url: String,
        /// Scopes joined by a single space in the token request
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default)]
        audience: Option<String>,
        /// Extra static form fields sent with the token request
        #[serde(default)]
        extra_params: HashMap<String, String>,
    },
}

impl Default for Credentials {
    fn default() -> Self {
        Self::None
    }
}

impl Credentials {
    /// True when resolving a token requires a token-endpoint round trip
    pub fn requires_exchange(&self) -> bool {
        matches!(self, Credentials::ClientCredentials { .. })
    }
}

/// Last issued token for an endpoint using a credential flow
///
/// Persisted alongside the endpoint by the endpoint store so a token survives
/// process restarts. The invoker never writes this in place; a refreshed
/// value is handed back to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCache {
    /// Bearer token issued by the token endpoint
    pub access_token: String,
    /// Instant the token stops being usable
    pub expires_at: DateTime<Utc>,
}

impl TokenCache {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// True while the token can still be sent
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

/// One externally configured invocation target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint identifier
    pub id: Uuid,
    /// Human-readable endpoint name
    pub name: String,
    /// Protocol the endpoint speaks
    pub protocol: ProtocolKind,
    /// Base URL (scheme + host, optionally a path prefix)
    pub base_url: String,
    /// Path appended to the base URL
    #[serde(default)]
    pub path: Option<String>,
    /// HTTP method for REST endpoints; POST when unset
    #[serde(default)]
    pub method: Option<String>,
    /// Static and templated header values
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Static and templated query parameters
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    /// Request body template rendered against the invocation input
    #[serde(default)]
    pub request_body_template: Option<Value>,
    /// Template variable name -> input key it is filled from
    #[serde(default)]
    pub request_mappings: HashMap<String, String>,
    /// Declared response body format
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// Output key -> path expression into the raw response
    #[serde(default)]
    pub response_mappings: HashMap<String, String>,
    /// How the endpoint authenticates
    #[serde(default)]
    pub credentials: Credentials,
    /// Last issued token, persisted by the endpoint store
    #[serde(default)]
    pub token_cache: Option<TokenCache>,
    /// Protocol-specific metadata (relay function name and client identity)
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl EndpointConfig {
    /// Create a minimal endpoint record; shaping fields start empty
    pub fn new(name: impl Into<String>, protocol: ProtocolKind, base_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            protocol,
            base_url: base_url.into(),
            path: None,
            method: None,
            headers: HashMap::new(),
            query_params: HashMap::new(),
            request_body_template: None,
            request_mappings: HashMap::new(),
            response_format: ResponseFormat::default(),
            response_mappings: HashMap::new(),
            credentials: Credentials::None,
            token_cache: None,
            metadata: HashMap::new(),
        }
    }

    /// String metadata value, if present and a string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_kind_serde() {
        assert_eq!(serde_json::to_value(ProtocolKind::Rest).unwrap(), json!("rest"));
        assert_eq!(serde_json::to_value(ProtocolKind::Stream).unwrap(), json!("stream"));
        assert_eq!(
            serde_json::from_value::<ProtocolKind>(json!("relay")).unwrap(),
            ProtocolKind::Relay
        );
    }

    #[test]
    fn test_credentials_tagged_serde() {
        let creds: Credentials = serde_json::from_value(json!({
            "kind": "client_credentials",
            "client_id": "cid",
            "client_secret": "shh",
            "token_url": "https://auth.example.com/token",
            "scopes": ["read", "write"]
        }))
        .unwrap();

        assert!(creds.requires_exchange());
        match creds {
            Credentials::ClientCredentials { client_id, scopes, audience, .. } => {
                assert_eq!(client_id, "cid");
                assert_eq!(scopes, vec!["read", "write"]);
                assert!(audience.is_none());
            }
            other => panic!("unexpected credentials: {:?}", other),
        }

        let none: Credentials = serde_json::from_value(json!({ "kind": "none" })).unwrap();
        assert!(!none.requires_exchange());
    }

    #[test]
    fn test_token_cache_validity() {
        let valid = TokenCache::new("tok", Utc::now() + chrono::Duration::minutes(5));
        assert!(valid.is_valid());

        let expired = TokenCache::new("tok", Utc::now() - chrono::Duration::seconds(1));
        assert!(!expired.is_valid());
    }

    #[test]
    fn test_endpoint_defaults_roundtrip() {
        let raw = json!({
            "id": "6e9dd1f4-3f4b-4a86-a9f0-2f2f8d2f6f11",
            "name": "chat-bot",
            "protocol": "rest",
            "base_url": "https://api.example.com"
        });

        let endpoint: EndpointConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(endpoint.name, "chat-bot");
        assert_eq!(endpoint.response_format, ResponseFormat::Json);
        assert!(endpoint.headers.is_empty());
        assert!(endpoint.token_cache.is_none());
        assert!(matches!(endpoint.credentials, Credentials::None));
    }

    #[test]
    fn test_metadata_str() {
        let mut endpoint = EndpointConfig::new("sdk", ProtocolKind::Relay, "relay://local");
        endpoint.metadata.insert("function".to_string(), json!("answer"));
        endpoint.metadata.insert("retries".to_string(), json!(3));

        assert_eq!(endpoint.metadata_str("function"), Some("answer"));
        assert_eq!(endpoint.metadata_str("retries"), None);
        assert_eq!(endpoint.metadata_str("missing"), None);
    }
}
