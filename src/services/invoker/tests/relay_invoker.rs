//! Integration tests for the relay invoker
//!
//! These tests drive local dispatch through the connection registry with a
//! simulated client task, and the relay path through a scripted transport,
//! validating routing, argument shaping, result classification, and
//! configuration errors. The redis wire itself is exercised against a live
//! broker in deployment smoke tests, not here.

use ai_probe_shared::types::{
    EndpointConfig, ErrorKind, InvocationRequest, ProtocolDiagnostics, ProtocolKind,
};
use async_trait::async_trait;
use invoker_service::registry::{
    CallStatus, ClientConnection, ClientKey, ConnectionRegistry, FunctionCall, FunctionResult,
};
use invoker_service::relay::{RelayError, RelayTransport};
use invoker_service::{InvokerError, InvokerFactory, InvokerSettings};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn relay_endpoint() -> EndpointConfig {
    let mut endpoint =
        EndpointConfig::new("sdk-under-test", ProtocolKind::Relay, "relay://local");
    endpoint.metadata.insert("function".to_string(), json!("answer"));
    endpoint.metadata.insert("project_id".to_string(), json!("proj-1"));
    endpoint.metadata.insert("environment".to_string(), json!("prod"));
    endpoint
}

fn client_key() -> ClientKey {
    ClientKey::new("proj-1", "prod")
}

fn request_with(input: Value) -> InvocationRequest {
    InvocationRequest::new(input.as_object().cloned().unwrap())
}

fn factory_with(registry: &ConnectionRegistry) -> InvokerFactory {
    InvokerFactory::new(InvokerSettings::default())
        .expect("factory should build")
        .with_registry(registry.clone())
}

/// Test double for the relay transport with scripted answers
///
/// Clones share state, so a test can keep a handle and inspect the calls
/// the invoker relayed.
#[derive(Clone)]
struct FakeRelay {
    presence: Result<bool, String>,
    answer: Arc<Mutex<Option<Result<FunctionResult, RelayError>>>>,
    calls: Arc<Mutex<Vec<(ClientKey, String, Map<String, Value>)>>>,
}

impl FakeRelay {
    fn new(
        presence: Result<bool, String>,
        answer: Option<Result<FunctionResult, RelayError>>,
    ) -> Self {
        Self {
            presence,
            answer: Arc::new(Mutex::new(answer)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn disconnected() -> Self {
        Self::new(Ok(false), None)
    }

    fn unreachable(detail: &str) -> Self {
        Self::new(Err(detail.to_string()), None)
    }

    fn answering(result: FunctionResult) -> Self {
        Self::new(Ok(true), Some(Ok(result)))
    }

    fn failing(error: RelayError) -> Self {
        Self::new(Ok(true), Some(Err(error)))
    }

    fn relayed_calls(&self) -> Vec<(ClientKey, String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn is_client_connected(&self, _key: &ClientKey) -> Result<bool, RelayError> {
        self.presence.clone().map_err(RelayError::Transport)
    }

    async fn call(
        &self,
        key: &ClientKey,
        function: &str,
        arguments: Map<String, Value>,
        _timeout: Duration,
    ) -> Result<FunctionResult, RelayError> {
        self.calls
            .lock()
            .unwrap()
            .push((key.clone(), function.to_string(), arguments));
        self.answer
            .lock()
            .unwrap()
            .take()
            .unwrap_or(Err(RelayError::Timeout))
    }
}

/// Test helper: register a connection whose client answers one call with
/// the given result and reports what it received
fn serve_one(
    registry: &ConnectionRegistry,
    result: FunctionResult,
) -> oneshot::Receiver<FunctionCall> {
    let (connection, mut calls) = ClientConnection::new(client_key());
    registry.register(Arc::clone(&connection));

    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Some(call) = calls.recv().await {
            let correlation_id = call.correlation_id;
            seen_tx.send(call).ok();
            connection.complete(correlation_id, result);
        }
    });
    seen_rx
}

#[tokio::test]
async fn test_local_dispatch_round_trip() {
    let registry = ConnectionRegistry::new();
    let seen = serve_one(
        &registry,
        FunctionResult::completed(json!({"answer": "hi", "conversation_id": "c-1"}), 7),
    );

    let mut endpoint = relay_endpoint();
    endpoint
        .response_mappings
        .insert("output".to_string(), "$.answer".to_string());
    endpoint
        .response_mappings
        .insert("conversation_id".to_string(), "$.conversation_id".to_string());

    let result = factory_with(&registry)
        .invoke(&endpoint, &request_with(json!({"question": "hello"})))
        .await
        .expect("invoke should not raise");

    let output = result.output().expect("local dispatch should succeed");
    assert_eq!(output["output"], json!("hi"));
    assert_eq!(output["conversation_id"], json!("c-1"));

    let call = seen.await.expect("client should have received the call");
    assert_eq!(call.function, "answer");
    assert_eq!(call.arguments["question"], json!("hello"));
}

#[tokio::test]
async fn test_arguments_carry_conversation_and_strip_identity() {
    let registry = ConnectionRegistry::new();
    let seen = serve_one(&registry, FunctionResult::completed(json!({}), 1));

    let mut endpoint = relay_endpoint();
    endpoint
        .response_mappings
        .insert("conversation_id".to_string(), "$.conversation_id".to_string());

    let request = request_with(json!({"question": "hi"}))
        .with_identity("org-1", "user-1")
        .with_session("s-5");

    let result = factory_with(&registry)
        .invoke(&endpoint, &request)
        .await
        .unwrap();

    // Client produced no conversation value; the sent one is kept
    let output = result.output().unwrap();
    assert_eq!(output["conversation_id"], json!("s-5"));

    let call = seen.await.unwrap();
    assert_eq!(call.arguments["conversation_id"], json!("s-5"));
    assert!(!call.arguments.contains_key("organization_id"));
    assert!(!call.arguments.contains_key("user_id"));
}

#[tokio::test]
async fn test_unmapped_output_passes_through() {
    let registry = ConnectionRegistry::new();
    serve_one(&registry, FunctionResult::completed(json!("plain answer"), 3));

    let result = factory_with(&registry)
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    assert_eq!(result.output().unwrap()["output"], json!("plain answer"));
}

#[tokio::test]
async fn test_missing_metadata_is_a_configuration_error() {
    let mut endpoint = relay_endpoint();
    endpoint.metadata.remove("environment");

    let outcome = factory_with(&ConnectionRegistry::new())
        .invoke(&endpoint, &request_with(json!({})))
        .await;

    match outcome {
        Err(InvokerError::Configuration { message }) => {
            assert!(message.contains("environment"));
        }
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_connection_and_no_relay_is_rpc_unavailable() {
    let result = factory_with(&ConnectionRegistry::new())
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    let error = result.error().expect("missing transport should be a data error");
    assert_eq!(error.kind, ErrorKind::SdkRpcUnavailable);
    let snapshot = error.request.as_ref().expect("snapshot should be attached");
    assert_eq!(snapshot.url, "relay://proj-1/prod/answer");
}

#[tokio::test]
async fn test_worker_mode_never_dispatches_locally() {
    let registry = ConnectionRegistry::new();
    // A live local connection exists, but workers must not use it
    serve_one(&registry, FunctionResult::completed(json!({}), 1));

    let factory = InvokerFactory::new(InvokerSettings::default())
        .expect("factory should build")
        .with_registry(registry.clone())
        .worker_mode(true);

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    assert_eq!(result.error().unwrap().kind, ErrorKind::SdkRpcUnavailable);
}

#[tokio::test]
async fn test_remote_error_is_a_function_error() {
    let registry = ConnectionRegistry::new();
    serve_one(&registry, FunctionResult::error("boom in client code", 12));

    let result = factory_with(&registry)
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SdkFunctionError);
    assert!(error.technical_message.contains("boom in client code"));
    match &error.diagnostics {
        Some(ProtocolDiagnostics::Relay { duration_ms }) => {
            assert_eq!(*duration_ms, Some(12));
        }
        other => panic!("expected relay diagnostics, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_reported_timeout_maps_to_sdk_timeout() {
    let registry = ConnectionRegistry::new();
    serve_one(
        &registry,
        FunctionResult {
            status: CallStatus::Timeout,
            output: None,
            error: None,
            duration_ms: Some(30_000),
        },
    );

    let result = factory_with(&registry)
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    assert_eq!(result.error().unwrap().kind, ErrorKind::SdkTimeout);
}

#[tokio::test]
async fn test_dispatch_timeout_when_client_never_answers() {
    let registry = ConnectionRegistry::new();
    let (connection, mut calls) = ClientConnection::new(client_key());
    registry.register(Arc::clone(&connection));
    // Swallow the call without ever completing it
    tokio::spawn(async move {
        let _call = calls.recv().await;
    });

    let mut settings = InvokerSettings::default();
    settings.relay.dispatch_timeout = 1;
    let factory = InvokerFactory::new(settings)
        .expect("factory should build")
        .with_registry(registry.clone());

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SdkTimeout);
    match &error.diagnostics {
        Some(ProtocolDiagnostics::Relay { duration_ms }) => {
            assert!(duration_ms.unwrap_or(0) >= 1_000);
        }
        other => panic!("expected relay diagnostics, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_failed_when_client_detaches() {
    let registry = ConnectionRegistry::new();
    let (connection, calls) = ClientConnection::new(client_key());
    registry.register(Arc::clone(&connection));
    // The transport task is gone; sends can no longer be accepted
    drop(calls);

    let result = factory_with(&registry)
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    assert_eq!(result.error().unwrap().kind, ErrorKind::SdkSendFailed);
}

#[tokio::test]
async fn test_body_template_shapes_arguments() {
    let registry = ConnectionRegistry::new();
    let seen = serve_one(&registry, FunctionResult::completed(json!({}), 1));

    let mut endpoint = relay_endpoint();
    endpoint.request_body_template = Some(json!({
        "query": "{{question}}",
        "mode": "fast"
    }));

    let result = factory_with(&registry)
        .invoke(&endpoint, &request_with(json!({"question": "why?", "noise": 1})))
        .await
        .unwrap();
    assert!(result.is_success());

    let call = seen.await.unwrap();
    let expected: Map<String, Value> = json!({"query": "why?", "mode": "fast"})
        .as_object()
        .cloned()
        .unwrap();
    assert_eq!(call.arguments, expected);
}

#[tokio::test]
async fn test_relay_reports_disconnected_client() {
    let factory = factory_with(&ConnectionRegistry::new()).with_relay(FakeRelay::disconnected());

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .expect("a disconnected client is a data error, not a raised one");

    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SdkNotConnected);
    assert!(error.technical_message.contains("proj-1/prod"));
    assert!(error.request.is_some());
}

#[tokio::test]
async fn test_relay_round_trip_completes() {
    let relay = FakeRelay::answering(FunctionResult::completed(
        json!({"answer": "hi", "conversation_id": "c-2"}),
        9,
    ));
    let mut endpoint = relay_endpoint();
    endpoint
        .response_mappings
        .insert("output".to_string(), "$.answer".to_string());
    endpoint
        .response_mappings
        .insert("conversation_id".to_string(), "$.conversation_id".to_string());

    let result = factory_with(&ConnectionRegistry::new())
        .with_relay(relay.clone())
        .invoke(&endpoint, &request_with(json!({"question": "hello"})))
        .await
        .unwrap();

    let output = result.output().expect("relayed dispatch should succeed");
    assert_eq!(output["output"], json!("hi"));
    assert_eq!(output["conversation_id"], json!("c-2"));

    let calls = relay.relayed_calls();
    assert_eq!(calls.len(), 1);
    let (key, function, arguments) = &calls[0];
    assert_eq!(key, &client_key());
    assert_eq!(function, "answer");
    assert_eq!(arguments["question"], json!("hello"));
}

#[tokio::test]
async fn test_relay_presence_failure_is_rpc_unavailable() {
    let factory = factory_with(&ConnectionRegistry::new())
        .with_relay(FakeRelay::unreachable("connection refused"));

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SdkRpcUnavailable);
    assert!(error.technical_message.contains("connection refused"));
}

#[tokio::test]
async fn test_relay_transport_failure_is_unexpected() {
    let factory = factory_with(&ConnectionRegistry::new())
        .with_relay(FakeRelay::failing(RelayError::Transport(
            "redis gone".to_string(),
        )));

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    let error = result.error().unwrap();
    assert_eq!(error.kind, ErrorKind::UnexpectedError);
    assert!(error.technical_message.contains("redis gone"));
}

#[tokio::test]
async fn test_relay_delivery_failures_classify() {
    let send_failed = factory_with(&ConnectionRegistry::new())
        .with_relay(FakeRelay::failing(RelayError::SendFailed))
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();
    assert_eq!(send_failed.error().unwrap().kind, ErrorKind::SdkSendFailed);

    let timed_out = factory_with(&ConnectionRegistry::new())
        .with_relay(FakeRelay::failing(RelayError::Timeout))
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();
    let error = timed_out.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SdkTimeout);
    assert!(matches!(
        error.diagnostics,
        Some(ProtocolDiagnostics::Relay { .. })
    ));
}

#[tokio::test]
async fn test_worker_mode_relays_despite_local_connection() {
    let registry = ConnectionRegistry::new();
    serve_one(&registry, FunctionResult::completed(json!({"from": "local"}), 1));

    let relay = FakeRelay::answering(FunctionResult::completed(json!({"from": "relay"}), 2));
    let factory = InvokerFactory::new(InvokerSettings::default())
        .expect("factory should build")
        .with_registry(registry.clone())
        .with_relay(relay.clone())
        .worker_mode(true);

    let result = factory
        .invoke(&relay_endpoint(), &request_with(json!({})))
        .await
        .unwrap();

    assert_eq!(result.output().unwrap()["from"], json!("relay"));
    assert_eq!(relay.relayed_calls().len(), 1);
}
