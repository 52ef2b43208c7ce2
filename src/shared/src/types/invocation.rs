//! Invocation envelope types
//!
//! One `InvocationRequest` goes in, exactly one `InvocationResult` comes
//! back: either a normalized output map or a structured `ErrorResponse`,
//! never both. Runtime failures travel as data so a batch test run keeps
//! going; only configuration-level problems are raised as errors by the
//! invoker service.

use crate::types::endpoint::ProtocolKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Reserved input key carrying the calling organization id
pub const ORGANIZATION_ID_KEY: &str = "organization_id";
/// Reserved input key carrying the calling user id
pub const USER_ID_KEY: &str = "user_id";

/// One call into an endpoint
///
/// The identity fields are injected by the platform, never by the caller;
/// same-named keys in `input` are ignored wherever identity matters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Caller-supplied input fields
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Organization the call is made on behalf of
    #[serde(default)]
    pub organization_id: Option<String>,
    /// User the call is made on behalf of
    #[serde(default)]
    pub user_id: Option<String>,
    /// Externally supplied conversation/session value
    #[serde(default)]
    pub session_id: Option<String>,
}

impl InvocationRequest {
    pub fn new(input: Map<String, Value>) -> Self {
        Self {
            input,
            organization_id: None,
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_identity(
        mut self,
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.organization_id = Some(organization_id.into());
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Input merged with the reserved identity keys; identity always wins
    pub fn context_map(&self) -> Map<String, Value> {
        let mut context = self.input.clone();
        if let Some(org) = &self.organization_id {
            context.insert(ORGANIZATION_ID_KEY.to_string(), Value::String(org.clone()));
        }
        if let Some(user) = &self.user_id {
            context.insert(USER_ID_KEY.to_string(), Value::String(user.clone()));
        }
        context
    }

    /// Input with the reserved identity keys stripped
    pub fn filtered_input(&self) -> Map<String, Value> {
        let mut input = self.input.clone();
        input.remove(ORGANIZATION_ID_KEY);
        input.remove(USER_ID_KEY);
        input
    }
}

/// Classification of a runtime invocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkError,
    HttpError,
    JsonParsingError,
    WebsocketConnectionError,
    WebsocketCommunicationError,
    SdkRpcUnavailable,
    SdkNotConnected,
    SdkSendFailed,
    SdkTimeout,
    SdkFunctionError,
    UnexpectedError,
}

impl ErrorKind {
    /// Wire name of the error kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network_error",
            ErrorKind::HttpError => "http_error",
            ErrorKind::JsonParsingError => "json_parsing_error",
            ErrorKind::WebsocketConnectionError => "websocket_connection_error",
            ErrorKind::WebsocketCommunicationError => "websocket_communication_error",
            ErrorKind::SdkRpcUnavailable => "sdk_rpc_unavailable",
            ErrorKind::SdkNotConnected => "sdk_not_connected",
            ErrorKind::SdkSendFailed => "sdk_send_failed",
            ErrorKind::SdkTimeout => "sdk_timeout",
            ErrorKind::SdkFunctionError => "sdk_function_error",
            ErrorKind::UnexpectedError => "unexpected_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sanitized snapshot of the request that produced an error
///
/// Header values are redacted before the snapshot is built; raw secrets never
/// appear in diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub protocol: ProtocolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Protocol-specific failure detail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolDiagnostics {
    Http {
        status_code: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Socket {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_body: Option<Value>,
    },
    Relay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
}

/// Uniform error envelope carried inside a failed invocation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    /// Message suitable for display to the platform user
    pub message: String,
    /// Technical detail for operators and logs
    pub technical_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ProtocolDiagnostics>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    /// Start building an error envelope of the given kind
    pub fn builder(kind: ErrorKind) -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(kind)
    }
}

/// Builder for the uniform error envelope
#[derive(Debug)]
pub struct ErrorResponseBuilder {
    kind: ErrorKind,
    message: Option<String>,
    technical_message: Option<String>,
    request: Option<RequestSnapshot>,
    diagnostics: Option<ProtocolDiagnostics>,
}

impl ErrorResponseBuilder {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            technical_message: None,
            request: None,
            diagnostics: None,
        }
    }

    /// User-facing message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Technical message for logs; defaults to the user-facing message
    pub fn technical(mut self, technical_message: impl Into<String>) -> Self {
        self.technical_message = Some(technical_message.into());
        self
    }

    pub fn request(mut self, request: RequestSnapshot) -> Self {
        self.request = Some(request);
        self
    }

    pub fn diagnostics(mut self, diagnostics: ProtocolDiagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> ErrorResponse {
        let message = self
            .message
            .unwrap_or_else(|| "The endpoint could not be invoked".to_string());
        let technical_message = self.technical_message.unwrap_or_else(|| message.clone());
        ErrorResponse {
            kind: self.kind,
            message,
            technical_message,
            request: self.request,
            diagnostics: self.diagnostics,
            timestamp: Utc::now(),
        }
    }
}

/// Discriminated outcome of one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResult {
    /// Normalized output extracted from the endpoint response
    Success { output: Map<String, Value> },
    /// Structured runtime failure
    Error { error: ErrorResponse },
}

impl InvocationResult {
    pub fn success(output: Map<String, Value>) -> Self {
        Self::Success { output }
    }

    pub fn failure(error: ErrorResponse) -> Self {
        Self::Error { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn output(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Success { output } => Some(output),
            Self::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorResponse> {
        match self {
            Self::Success { .. } => None,
            Self::Error { error } => Some(error),
        }
    }
}
