//! # Invoker Service
//!
//! Endpoint invocation layer for the AI-PROBE platform that provides:
//! - Synchronous REST invocation with transport-level retries
//! - Duplex websocket streaming with chunk accumulation and end-marker handling
//! - Named-function calls to detached SDK clients, dispatched locally or
//!   relayed over redis to the process holding the connection
//! - OAuth2 client-credentials and static bearer authentication with cached,
//!   refresh-on-expiry tokens
//! - Request body templating, JSONPath response mapping, conversation
//!   tracking across turns, and Unicode text normalization
//! - A uniform error taxonomy carried as data so a batch test run keeps
//!   going when one invocation fails
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ai_probe_shared::types::{EndpointConfig, InvocationRequest, ProtocolKind};
//! use invoker_service::{InvokerFactory, InvokerSettings};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = InvokerFactory::new(InvokerSettings::default())?;
//!
//!     let mut endpoint =
//!         EndpointConfig::new("chat-bot", ProtocolKind::Rest, "https://api.example.com");
//!     endpoint.path = Some("/v1/chat".to_string());
//!     endpoint
//!         .response_mappings
//!         .insert("output".to_string(), "$.result.text".to_string());
//!
//!     let input = json!({"question": "What is the capital of France?"});
//!     let request = InvocationRequest::new(input.as_object().cloned().unwrap());
//!
//!     let result = factory.invoke(&endpoint, &request).await?;
//!     println!("{:?}", result.output());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod conversation;
pub mod error;
pub mod headers;
pub mod invokers;
pub mod mapping;
pub mod normalize;
pub mod registry;
pub mod relay;
pub mod template;

pub use config::InvokerSettings;
pub use error::{InvokerError, InvokerResult};
pub use invokers::{Invoker, InvokerFactory, RelayInvoker, RestInvoker, StreamInvoker};
pub use registry::{
    CallStatus, ClientConnection, ClientKey, ConnectionRegistry, FunctionCall, FunctionResult,
};
pub use relay::{RelayClient, RelayTransport};

// Re-export shared types for convenience
pub use ai_probe_shared::types::{
    Credentials, EndpointConfig, ErrorKind, ErrorResponse, InvocationRequest, InvocationResult,
    ProtocolDiagnostics, ProtocolKind, RequestSnapshot, ResponseFormat, TokenCache,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "invoker-service";
