//! Message-relay invoker
//!
//! Invokes a named function on a detached client. When this process holds
//! the client's live connection the call is dispatched locally through the
//! connection registry; otherwise it is relayed over the broker to whichever
//! process does. Background workers never hold connections and always relay.

use super::{Invoker, InvokerContext};
use crate::conversation::ConversationContext;
use crate::error::{InvokerError, InvokerResult};
use crate::mapping::ResponseMapper;
use crate::registry::{CallError, CallStatus, ClientKey, FunctionResult};
use crate::relay::{RelayError, RelayTransport};
use ai_probe_shared::types::{
    EndpointConfig, ErrorKind, ErrorResponse, InvocationRequest, InvocationResult,
    ProtocolDiagnostics, ProtocolKind, RequestSnapshot,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Metadata key naming the client function to call
const FUNCTION_KEY: &str = "function";
/// Metadata key naming the owning project
const PROJECT_KEY: &str = "project_id";
/// Metadata key naming the deployment environment
const ENVIRONMENT_KEY: &str = "environment";

/// Invoker for endpoints backed by a detached client function
pub struct RelayInvoker {
    context: InvokerContext,
}

impl RelayInvoker {
    pub fn new(context: InvokerContext) -> Self {
        Self { context }
    }

    fn metadata_value<'a>(
        &self,
        endpoint: &'a EndpointConfig,
        key: &str,
    ) -> InvokerResult<&'a str> {
        endpoint.metadata_str(key).ok_or_else(|| {
            InvokerError::configuration(format!(
                "Relay endpoint '{}' is missing the '{}' metadata key",
                endpoint.name, key
            ))
        })
    }
}

#[async_trait::async_trait]
impl Invoker for RelayInvoker {
    async fn invoke(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> InvokerResult<InvocationResult> {
        let function = self.metadata_value(endpoint, FUNCTION_KEY)?.to_string();
        let key = ClientKey::new(
            self.metadata_value(endpoint, PROJECT_KEY)?,
            self.metadata_value(endpoint, ENVIRONMENT_KEY)?,
        );

        let conversation = self.context.conversation_for(endpoint, request);
        let mut context = self
            .context
            .render_context(endpoint, request, conversation.as_ref());

        // Arguments: conversation merged into the caller's input, identity
        // keys stripped, shaped by the body template when one is configured.
        let arguments = match &endpoint.request_body_template {
            Some(template) => match self.context.renderer.render(template, &mut context) {
                Value::Object(fields) => fields,
                other => {
                    warn!(
                        endpoint = %endpoint.name,
                        "Relay body template did not render to an object; wrapping it"
                    );
                    let mut wrapped = Map::new();
                    wrapped.insert("input".to_string(), other);
                    wrapped
                }
            },
            None => {
                warn!(
                    endpoint = %endpoint.name,
                    "No request body template configured; passing input through"
                );
                let mut arguments = request.filtered_input();
                if let Some(tracked) = &conversation {
                    if !arguments.contains_key(&tracked.field) {
                        if let Some(value) = context.get(&tracked.field) {
                            arguments.insert(tracked.field.clone(), value.clone());
                        }
                    }
                }
                arguments
            }
        };

        let snapshot = RequestSnapshot {
            protocol: ProtocolKind::Relay,
            method: None,
            url: format!("relay://{}/{}/{}", key.project_id, key.environment, function),
            headers: HashMap::new(),
            body: Some(
                self.context
                    .headers
                    .sanitize_value(&Value::Object(arguments.clone())),
            ),
        };

        let timeout = self.context.dispatch_timeout();
        let local = if self.context.worker_mode {
            None
        } else {
            self.context.registry.get(&key)
        };
        let started = Instant::now();

        let result = match local {
            Some(connection) => {
                debug!(
                    endpoint = %endpoint.name,
                    function = %function,
                    project_id = %key.project_id,
                    environment = %key.environment,
                    "Dispatching call to local client connection"
                );
                match connection.call(&function, arguments, timeout).await {
                    Ok(result) => result,
                    Err(CallError::SendFailed) => {
                        return Ok(InvocationResult::failure(self.dispatch_error(
                            ErrorKind::SdkSendFailed,
                            "The call could not be delivered to the client",
                            "Local client connection stopped accepting calls",
                            snapshot,
                            started,
                        )));
                    }
                    Err(CallError::Timeout) => {
                        return Ok(InvocationResult::failure(self.dispatch_error(
                            ErrorKind::SdkTimeout,
                            "The client did not answer in time",
                            format!("No result within {}s", timeout.as_secs()),
                            snapshot,
                            started,
                        )));
                    }
                }
            }
            None => {
                let relay = match &self.context.relay {
                    Some(relay) => relay,
                    None => {
                        warn!(endpoint = %endpoint.name, "Relay transport is not configured");
                        let error = ErrorResponse::builder(ErrorKind::SdkRpcUnavailable)
                            .message("Calls to detached clients are not available")
                            .technical("No relay transport is configured for this process")
                            .request(snapshot)
                            .build();
                        return Ok(InvocationResult::failure(error));
                    }
                };
                match relay.is_client_connected(&key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        let error = ErrorResponse::builder(ErrorKind::SdkNotConnected)
                            .message("The target client is not connected")
                            .technical(format!(
                                "No client announced for {}/{}",
                                key.project_id, key.environment
                            ))
                            .request(snapshot)
                            .build();
                        return Ok(InvocationResult::failure(error));
                    }
                    Err(e) => {
                        let error = ErrorResponse::builder(ErrorKind::SdkRpcUnavailable)
                            .message("Calls to detached clients are not available")
                            .technical(format!("Relay presence check failed: {}", e))
                            .request(snapshot)
                            .build();
                        return Ok(InvocationResult::failure(error));
                    }
                }
                debug!(
                    endpoint = %endpoint.name,
                    function = %function,
                    project_id = %key.project_id,
                    environment = %key.environment,
                    "Relaying call to the process owning the client connection"
                );
                match relay.call(&key, &function, arguments, timeout).await {
                    Ok(result) => result,
                    Err(RelayError::SendFailed) => {
                        return Ok(InvocationResult::failure(self.dispatch_error(
                            ErrorKind::SdkSendFailed,
                            "The call could not be delivered to the client",
                            "No host process accepted the relayed call",
                            snapshot,
                            started,
                        )));
                    }
                    Err(RelayError::Timeout) => {
                        return Ok(InvocationResult::failure(self.dispatch_error(
                            ErrorKind::SdkTimeout,
                            "The client did not answer in time",
                            format!("No relayed result within {}s", timeout.as_secs()),
                            snapshot,
                            started,
                        )));
                    }
                    Err(RelayError::Transport(detail)) => {
                        warn!(endpoint = %endpoint.name, detail = %detail, "Relay transport failed");
                        let error = ErrorResponse::builder(ErrorKind::UnexpectedError)
                            .message("The call failed in an unexpected way")
                            .technical(format!("Relay transport failure: {}", detail))
                            .request(snapshot)
                            .build();
                        return Ok(InvocationResult::failure(error));
                    }
                }
            }
        };

        match result.status {
            CallStatus::Completed => {
                let raw = result.output.unwrap_or(Value::Null);
                let output = shape_output(
                    &raw,
                    &endpoint.response_mappings,
                    &self.context.mapper,
                    conversation.as_ref(),
                    &context,
                );
                debug!(endpoint = %endpoint.name, function = %function, "Relay invocation complete");
                Ok(InvocationResult::success(output))
            }
            CallStatus::Error => {
                let technical = result
                    .error
                    .unwrap_or_else(|| "Client function failed without detail".to_string());
                let error = ErrorResponse::builder(ErrorKind::SdkFunctionError)
                    .message("The client function returned an error")
                    .technical(technical)
                    .request(snapshot)
                    .diagnostics(ProtocolDiagnostics::Relay {
                        duration_ms: result.duration_ms,
                    })
                    .build();
                Ok(InvocationResult::failure(error))
            }
            CallStatus::Timeout => Ok(InvocationResult::failure(self.dispatch_error(
                ErrorKind::SdkTimeout,
                "The client did not answer in time",
                "Client reported the call timed out",
                snapshot,
                started,
            ))),
            CallStatus::SendFailed => Ok(InvocationResult::failure(self.dispatch_error(
                ErrorKind::SdkSendFailed,
                "The call could not be delivered to the client",
                "Client reported the call was never delivered",
                snapshot,
                started,
            ))),
        }
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Relay
    }
}

impl RelayInvoker {
    fn dispatch_error(
        &self,
        kind: ErrorKind,
        message: &str,
        technical: impl Into<String>,
        snapshot: RequestSnapshot,
        started: Instant,
    ) -> ErrorResponse {
        ErrorResponse::builder(kind)
            .message(message)
            .technical(technical)
            .request(snapshot)
            .diagnostics(ProtocolDiagnostics::Relay {
                duration_ms: Some(started.elapsed().as_millis() as u64),
            })
            .build()
    }
}

/// Shape a completed call's output into the invocation result map
///
/// Mappings extract named fields when configured; otherwise the raw output
/// passes through, wrapped under `output` when it is not an object. The
/// conversation field is filled from the raw output, falling back to the
/// value that was sent.
fn shape_output(
    raw: &Value,
    mappings: &HashMap<String, String>,
    mapper: &ResponseMapper,
    conversation: Option<&ConversationContext>,
    context: &Map<String, Value>,
) -> Map<String, Value> {
    let mut output = if mappings.is_empty() {
        match raw {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("output".to_string(), other.clone());
                wrapped
            }
        }
    } else {
        mapper.apply(mappings, raw)
    };

    if let Some(tracked) = conversation {
        let missing = matches!(output.get(&tracked.field), None | Some(Value::Null));
        if missing {
            let value = raw
                .get(&tracked.field)
                .filter(|v| !v.is_null())
                .cloned()
                .or_else(|| context.get(&tracked.field).cloned());
            if let Some(value) = value {
                output.insert(tracked.field.clone(), value);
            }
        }
    }
    output
}
