//! Duplex streaming invoker
//!
//! Opens a websocket to the endpoint, sends one rendered message, then
//! accumulates incoming frames until the end marker arrives or the server
//! closes. Frames are either structured JSON objects or raw text chunks;
//! raw chunks are normalized and buffered, structured messages flush the
//! buffer and may carry `content`, an `error`, or the conversation field.
//! Credentials never travel as handshake headers; a resolved token is exposed
//! to the message template as the `access_token` context key.

use super::{Invoker, InvokerContext};
use crate::error::{InvokerError, InvokerResult};
use crate::mapping::ResponseMapper;
use crate::normalize::TextNormalizer;
use ai_probe_shared::types::{
    EndpointConfig, ErrorKind, ErrorResponse, InvocationRequest, InvocationResult,
    ProtocolDiagnostics, ProtocolKind, RequestSnapshot,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// Meta keys stripped from the outbound message before sending
const RESERVED_MESSAGE_KEYS: [&str; 1] = ["system_prompt"];

/// End-of-stream sentinel: exactly `{"message": "response ended"}`
const END_MARKER_KEY: &str = "message";
const END_MARKER_VALUE: &str = "response ended";

/// Invoker for endpoints speaking duplex websocket streaming
pub struct StreamInvoker {
    context: InvokerContext,
    normalizer: TextNormalizer,
}

impl StreamInvoker {
    pub fn new(context: InvokerContext) -> Self {
        Self {
            context,
            normalizer: TextNormalizer::new(),
        }
    }
}

#[async_trait::async_trait]
impl Invoker for StreamInvoker {
    async fn invoke(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> InvokerResult<InvocationResult> {
        let url = build_stream_url(endpoint)?;
        let conversation = self.context.conversation_for(endpoint, request);
        let mut context = self
            .context
            .render_context(endpoint, request, conversation.as_ref());

        if let Some(resolved) = self.context.resolve_token(endpoint).await? {
            context.insert(
                "access_token".to_string(),
                Value::String(resolved.access_token),
            );
        }

        // Handshake headers: configured values minus the protocol-reserved
        // set; credentials stay out of the handshake entirely.
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in &endpoint.headers {
            if is_reserved_handshake_header(name) {
                continue;
            }
            headers.insert(
                name.clone(),
                self.context.renderer.render_text(value, &mut context),
            );
        }
        if let Some(origin) = derive_origin(&endpoint.base_url) {
            headers.entry("Origin".to_string()).or_insert(origin);
        }
        headers
            .entry("User-Agent".to_string())
            .or_insert_with(|| self.context.settings.http.user_agent.clone());
        self.context.headers.inject_trust_headers(
            &mut headers,
            request.organization_id.as_deref(),
            request.user_id.as_deref(),
        );
        let sanitized_headers = self.context.headers.sanitize(&headers);

        // Outbound message: rendered template (or filtered input), the
        // conversation field merged in, reserved meta keys stripped.
        let mut payload = match &endpoint.request_body_template {
            Some(template) => self.context.renderer.render(template, &mut context),
            None => {
                debug!(
                    endpoint = %endpoint.name,
                    "No request body template configured; passing input through"
                );
                Value::Object(request.filtered_input())
            }
        };
        if let Value::Object(fields) = &mut payload {
            if let Some(tracked) = &conversation {
                if !fields.contains_key(&tracked.field) {
                    if let Some(value) = context.get(&tracked.field) {
                        fields.insert(tracked.field.clone(), value.clone());
                    }
                }
            }
            for key in RESERVED_MESSAGE_KEYS {
                fields.remove(key);
            }
        }

        let snapshot = RequestSnapshot {
            protocol: ProtocolKind::Stream,
            method: None,
            url: url.clone(),
            headers: sanitized_headers.clone(),
            body: Some(self.context.headers.sanitize_value(&payload)),
        };

        let handshake = match build_handshake(&url, &headers) {
            Ok(request) => request,
            Err(detail) => {
                let error = ErrorResponse::builder(ErrorKind::WebsocketConnectionError)
                    .message("The streaming endpoint could not be reached")
                    .technical(detail)
                    .request(snapshot)
                    .build();
                return Ok(InvocationResult::failure(error));
            }
        };

        debug!(endpoint = %endpoint.name, url = %url, "Opening stream connection");
        let connect_timeout = Duration::from_secs(self.context.settings.http.connect_timeout);
        let mut stream = match tokio::time::timeout(connect_timeout, connect_async(handshake)).await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status();
                warn!(endpoint = %endpoint.name, status = %status, "Stream handshake rejected");
                let response_headers: HashMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_string(),
                            value.to_str().unwrap_or_default().to_string(),
                        )
                    })
                    .collect();
                let body = response
                    .body()
                    .as_ref()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
                let error = ErrorResponse::builder(ErrorKind::WebsocketConnectionError)
                    .message("The streaming endpoint rejected the connection")
                    .technical(format!("Handshake rejected with status {}", status))
                    .request(snapshot)
                    .diagnostics(ProtocolDiagnostics::Http {
                        status_code: status.as_u16(),
                        reason: status.canonical_reason().map(str::to_string),
                        headers: self.context.headers.sanitize(&response_headers),
                        body,
                    })
                    .build();
                return Ok(InvocationResult::failure(error));
            }
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint.name, error = %e, "Stream connection failed");
                let error = ErrorResponse::builder(ErrorKind::WebsocketConnectionError)
                    .message("The streaming endpoint could not be reached")
                    .technical(format!("Websocket connect failed: {}", e))
                    .request(snapshot)
                    .build();
                return Ok(InvocationResult::failure(error));
            }
            Err(_) => {
                let error = ErrorResponse::builder(ErrorKind::WebsocketConnectionError)
                    .message("The streaming endpoint could not be reached")
                    .technical(format!(
                        "Websocket handshake timed out after {}s",
                        connect_timeout.as_secs()
                    ))
                    .request(snapshot)
                    .build();
                return Ok(InvocationResult::failure(error));
            }
        };

        let message_text = match &payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        if let Err(e) = stream.send(Message::Text(message_text)).await {
            let error = self.communication_error(snapshot, &e);
            return Ok(InvocationResult::failure(error));
        }

        let tracking_field = conversation.as_ref().map(|c| c.field.clone());
        let mut accumulator =
            StreamAccumulator::new(tracking_field.clone(), self.normalizer.clone());
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(frame))) => {
                    if accumulator.ingest(&frame) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let frame = String::from_utf8_lossy(&bytes).into_owned();
                    if accumulator.ingest(&frame) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(endpoint = %endpoint.name, error = %e, "Stream receive failed");
                    let error = self.communication_error(snapshot, &e);
                    return Ok(InvocationResult::failure(error));
                }
                None => break,
            }
        }

        // Graceful close is best effort; the response is already complete.
        if let Err(e) = stream.close(None).await {
            debug!(endpoint = %endpoint.name, error = %e, "Stream close failed");
        }

        let sent_value = tracking_field
            .as_deref()
            .and_then(|field| context.get(field))
            .cloned();
        let output = accumulator.finish(
            sent_value.as_ref(),
            &endpoint.response_mappings,
            &self.context.mapper,
        );
        debug!(endpoint = %endpoint.name, "Stream invocation complete");
        Ok(InvocationResult::success(output))
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Stream
    }
}

impl StreamInvoker {
    fn communication_error(
        &self,
        snapshot: RequestSnapshot,
        error: &tungstenite::Error,
    ) -> ErrorResponse {
        let message_body = snapshot.body.clone();
        ErrorResponse::builder(ErrorKind::WebsocketCommunicationError)
            .message("The stream failed before the response completed")
            .technical(format!("Websocket communication failed: {}", error))
            .request(snapshot)
            .diagnostics(ProtocolDiagnostics::Socket {
                close_code: None,
                close_reason: None,
                message_body,
            })
            .build()
    }
}

/// Accumulates incoming frames into the merged invocation output
///
/// Raw text chunks buffer until a structured message or the end of the
/// stream flushes them as one `content` entry; structured messages
/// contribute `content`, `error`, the conversation field, and any other
/// fields for the final merge.
struct StreamAccumulator {
    normalizer: TextNormalizer,
    tracking_field: Option<String>,
    contents: Vec<String>,
    buffer: String,
    captured_conversation: Option<Value>,
    last_error: Option<Value>,
    structured: Vec<Map<String, Value>>,
}

impl StreamAccumulator {
    fn new(tracking_field: Option<String>, normalizer: TextNormalizer) -> Self {
        Self {
            normalizer,
            tracking_field,
            contents: Vec::new(),
            buffer: String::new(),
            captured_conversation: None,
            last_error: None,
            structured: Vec::new(),
        }
    }

    /// Ingest one frame; true when the end marker arrived
    fn ingest(&mut self, frame: &str) -> bool {
        match serde_json::from_str::<Value>(frame) {
            Ok(Value::Object(fields)) => {
                self.flush_buffer();
                if is_end_marker(&fields) {
                    return true;
                }
                if let Some(error) = fields.get("error") {
                    if !error.is_null() {
                        self.last_error = Some(error.clone());
                    }
                }
                if let Some(field) = &self.tracking_field {
                    if let Some(value) = fields.get(field) {
                        if !value.is_null() {
                            self.captured_conversation = Some(value.clone());
                        }
                    }
                }
                match fields.get("content") {
                    Some(Value::String(text)) => {
                        self.contents.push(self.normalizer.normalize(text));
                    }
                    Some(Value::Null) | None => {}
                    Some(other) => {
                        self.contents.push(self.normalizer.normalize(&other.to_string()));
                    }
                }
                self.structured.push(fields);
                false
            }
            // Scalar JSON and unparseable frames are both raw text chunks
            _ => {
                self.buffer.push_str(&self.normalizer.normalize(frame));
                false
            }
        }
    }

    fn flush_buffer(&mut self) {
        if !self.buffer.is_empty() {
            self.contents.push(std::mem::take(&mut self.buffer));
        }
    }

    /// Merge everything seen into the final output map
    ///
    /// The mapping pass never erases information: fields present in the
    /// merged base but absent or nulled by the mapping are restored.
    fn finish(
        mut self,
        sent_conversation: Option<&Value>,
        mappings: &HashMap<String, String>,
        mapper: &ResponseMapper,
    ) -> Map<String, Value> {
        self.flush_buffer();

        let mut base = Map::new();
        let output = if self.contents.is_empty() {
            Value::Null
        } else {
            Value::String(self.contents.concat())
        };
        base.insert("output".to_string(), output);
        base.insert(
            "error".to_string(),
            self.last_error.clone().unwrap_or(Value::Null),
        );
        base.insert(
            "status".to_string(),
            Value::String(if self.last_error.is_some() {
                "error".to_string()
            } else {
                "completed".to_string()
            }),
        );
        if let Some(field) = &self.tracking_field {
            let value = self
                .captured_conversation
                .clone()
                .or_else(|| sent_conversation.cloned())
                .unwrap_or(Value::Null);
            base.insert(field.clone(), value);
        }

        for message in &self.structured {
            for (key, value) in message {
                if key == "content" {
                    continue;
                }
                let known = matches!(base.get(key), Some(existing) if !existing.is_null());
                if !known {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        if mappings.is_empty() {
            return base;
        }
        let mut mapped = mapper.apply(mappings, &Value::Object(base.clone()));
        for (key, value) in base {
            let lost = matches!(mapped.get(&key), None | Some(Value::Null));
            if lost && !value.is_null() {
                mapped.insert(key, value);
            }
        }
        mapped
    }
}

fn is_end_marker(fields: &Map<String, Value>) -> bool {
    fields.len() == 1
        && fields
            .get(END_MARKER_KEY)
            .and_then(Value::as_str)
            .map(|text| text == END_MARKER_VALUE)
            .unwrap_or(false)
}

/// Headers the websocket protocol owns; configured values never override them
fn is_reserved_handshake_header(name: &str) -> bool {
    let lowered = name.to_lowercase();
    matches!(lowered.as_str(), "upgrade" | "connection" | "authorization" | "host")
        || lowered.starts_with("sec-websocket-")
}

/// Map the endpoint's base URL to a websocket URL, appending the configured
/// path unless the base already ends with it
fn build_stream_url(endpoint: &EndpointConfig) -> InvokerResult<String> {
    let base = endpoint.base_url.trim_end_matches('/');
    let mut url = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("wss://") || base.starts_with("ws://") {
        base.to_string()
    } else {
        return Err(InvokerError::configuration(format!(
            "Endpoint URL '{}' is not usable for streaming",
            endpoint.base_url
        )));
    };

    if let Some(path) = endpoint.path.as_deref().filter(|p| !p.is_empty()) {
        let normalized = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        if !url.ends_with(&normalized) {
            url.push_str(&normalized);
        }
    }

    url::Url::parse(&url)
        .map_err(|e| InvokerError::configuration(format!("Invalid endpoint URL '{}': {}", url, e)))?;
    Ok(url)
}

/// Origin header derived from the base URL's scheme and host
fn derive_origin(base_url: &str) -> Option<String> {
    let parsed = url::Url::parse(base_url).ok()?;
    let scheme = match parsed.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        _ => return None,
    };
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", scheme, host, port)),
        None => Some(format!("{}://{}", scheme, host)),
    }
}

/// Handshake request carrying the filtered header set
fn build_handshake(
    url: &str,
    headers: &HashMap<String, String>,
) -> Result<tungstenite::handshake::client::Request, String> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("Invalid websocket URL: {}", e))?;
    let header_map = request.headers_mut();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("Invalid header name '{}'", name))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("Invalid value for header '{}'", name))?;
        header_map.insert(name, value);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accumulator(tracking: Option<&str>) -> StreamAccumulator {
        StreamAccumulator::new(tracking.map(str::to_string), TextNormalizer::new())
    }

    fn no_mappings() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_raw_chunks_concatenate_in_order() {
        let mut acc = accumulator(None);
        assert!(!acc.ingest("He"));
        assert!(!acc.ingest("llo"));
        assert!(acc.ingest(r#"{"message": "response ended"}"#));

        let output = acc.finish(None, &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["output"], json!("Hello"));
        assert_eq!(output["status"], json!("completed"));
        assert_eq!(output["error"], json!(null));
    }

    #[test]
    fn test_structured_message_flushes_buffer_first() {
        let mut acc = accumulator(Some("conversation_id"));
        acc.ingest("a");
        acc.ingest(r#"{"content": "b", "conversation_id": "c-99"}"#);
        acc.ingest("d");

        let output = acc.finish(
            Some(&json!("c-from-request")),
            &no_mappings(),
            &ResponseMapper::new(),
        );
        assert_eq!(output["output"], json!("abd"));
        // Captured value overrides what the request carried
        assert_eq!(output["conversation_id"], json!("c-99"));
    }

    #[test]
    fn test_conversation_falls_back_to_sent_value() {
        let mut acc = accumulator(Some("session_id"));
        acc.ingest("text");

        let output = acc.finish(Some(&json!("s-1")), &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["session_id"], json!("s-1"));
    }

    #[test]
    fn test_error_field_marks_result_as_error() {
        let mut acc = accumulator(None);
        acc.ingest(r#"{"error": "model overloaded"}"#);

        let output = acc.finish(None, &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["status"], json!("error"));
        assert_eq!(output["error"], json!("model overloaded"));
        assert_eq!(output["output"], json!(null));
    }

    #[test]
    fn test_end_marker_must_match_exactly() {
        let mut acc = accumulator(None);
        assert!(!acc.ingest(r#"{"message": "response ended", "extra": 1}"#));
        assert!(!acc.ingest(r#"{"message": "still going"}"#));
        assert!(acc.ingest(r#"{"message": "response ended"}"#));
    }

    #[test]
    fn test_structured_fields_merge_without_overwriting() {
        let mut acc = accumulator(None);
        acc.ingest(r#"{"content": "hi", "usage": {"tokens": 12}}"#);
        acc.ingest(r#"{"usage": {"tokens": 99}, "model": "m-1"}"#);

        let output = acc.finish(None, &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["output"], json!("hi"));
        // First non-null value wins
        assert_eq!(output["usage"], json!({"tokens": 12}));
        assert_eq!(output["model"], json!("m-1"));
    }

    #[test]
    fn test_mapping_never_erases_known_fields() {
        let mut acc = accumulator(None);
        acc.ingest(r#"{"content": "hi", "usage": {"tokens": 3}}"#);

        let mappings: HashMap<String, String> =
            [("tokens".to_string(), "$.usage.tokens".to_string())]
                .into_iter()
                .collect();
        let output = acc.finish(None, &mappings, &ResponseMapper::new());

        assert_eq!(output["tokens"], json!(3));
        // Restored from the merged base even though the mapping dropped them
        assert_eq!(output["output"], json!("hi"));
        assert_eq!(output["status"], json!("completed"));
    }

    #[test]
    fn test_typographic_chunks_are_normalized() {
        let mut acc = accumulator(None);
        acc.ingest("\u{201C}hello\u{2014}world\u{2026}\u{201D}");

        let output = acc.finish(None, &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["output"], json!("\"hello-world...\""));
    }

    #[test]
    fn test_scalar_json_frame_is_raw_text() {
        let mut acc = accumulator(None);
        acc.ingest("42");
        acc.ingest(" apples");

        let output = acc.finish(None, &no_mappings(), &ResponseMapper::new());
        assert_eq!(output["output"], json!("42 apples"));
    }

    #[test]
    fn test_stream_url_scheme_and_path() {
        let mut endpoint =
            EndpointConfig::new("s", ProtocolKind::Stream, "https://api.example.com");
        endpoint.path = Some("/v1/stream".to_string());
        assert_eq!(
            build_stream_url(&endpoint).unwrap(),
            "wss://api.example.com/v1/stream"
        );

        endpoint.base_url = "http://api.example.com/v1/stream".to_string();
        assert_eq!(
            build_stream_url(&endpoint).unwrap(),
            "ws://api.example.com/v1/stream"
        );

        endpoint.base_url = "ws://direct.example.com".to_string();
        endpoint.path = None;
        assert_eq!(build_stream_url(&endpoint).unwrap(), "ws://direct.example.com");

        endpoint.base_url = "ftp://nope.example.com".to_string();
        assert!(build_stream_url(&endpoint).is_err());
    }

    #[test]
    fn test_origin_from_base_url() {
        assert_eq!(
            derive_origin("https://api.example.com/v1").as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(
            derive_origin("ws://localhost:9090/socket").as_deref(),
            Some("http://localhost:9090")
        );
        assert_eq!(derive_origin("not a url"), None);
    }

    #[test]
    fn test_reserved_handshake_headers() {
        assert!(is_reserved_handshake_header("Upgrade"));
        assert!(is_reserved_handshake_header("Sec-WebSocket-Key"));
        assert!(is_reserved_handshake_header("authorization"));
        assert!(!is_reserved_handshake_header("X-Custom"));
        assert!(!is_reserved_handshake_header("Origin"));
    }
}
