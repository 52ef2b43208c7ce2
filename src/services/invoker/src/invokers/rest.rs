//! Synchronous REST invoker
//!
//! One HTTP request per invocation. Non-2xx statuses are data results, never
//! retried; only transport-level failures (connect, timeout, DNS) go through
//! the retry schedule before failing as a network error.

use super::{Invoker, InvokerContext};
use crate::error::{InvokerError, InvokerResult};
use ai_probe_shared::types::{
    EndpointConfig, ErrorKind, ErrorResponse, InvocationRequest, InvocationResult,
    ProtocolDiagnostics, ProtocolKind, RequestSnapshot, ResponseFormat,
};
use reqwest::Method;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Invoker for endpoints speaking plain request/response HTTP
pub struct RestInvoker {
    context: InvokerContext,
}

impl RestInvoker {
    pub fn new(context: InvokerContext) -> Self {
        Self { context }
    }

    /// One send attempt: status, headers, and the full body text
    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        query: &[(String, String)],
        headers: &HashMap<String, String>,
        body: Option<&Value>,
    ) -> Result<(reqwest::StatusCode, HashMap<String, String>, String), reqwest::Error> {
        let mut builder = self.context.http.request(method.clone(), url);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(payload) = body {
            builder = builder.json(payload);
        }

        let response = builder.send().await?;
        let status = response.status();
        let response_headers = flatten_headers(response.headers());
        let body = response.text().await?;
        Ok((status, response_headers, body))
    }
}

#[async_trait::async_trait]
impl Invoker for RestInvoker {
    async fn invoke(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> InvokerResult<InvocationResult> {
        let method = parse_method(endpoint.method.as_deref())?;
        let url = build_url(endpoint)?;
        let conversation = self.context.conversation_for(endpoint, request);
        let mut context = self
            .context
            .render_context(endpoint, request, conversation.as_ref());

        let token = self.context.resolve_token(endpoint).await?;

        // Headers: configured values are templates too
        let mut headers: HashMap<String, String> = HashMap::new();
        for (name, value) in &endpoint.headers {
            headers.insert(
                name.clone(),
                self.context.renderer.render_text(value, &mut context),
            );
        }
        if !contains_header(&headers, "content-type") {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        if let Some(resolved) = &token {
            context.insert(
                "access_token".to_string(),
                Value::String(resolved.access_token.clone()),
            );
            if !contains_header(&headers, "authorization") {
                let value = self.context.renderer.render_text(
                    &self.context.settings.http.auth_header_template,
                    &mut context,
                );
                headers.insert("Authorization".to_string(), value);
            }
        }
        self.context.headers.inject_trust_headers(
            &mut headers,
            request.organization_id.as_deref(),
            request.user_id.as_deref(),
        );

        // Payload: the rendered template, or the filtered input when the
        // endpoint does not shape its requests
        let payload = match &endpoint.request_body_template {
            Some(template) => self.context.renderer.render(template, &mut context),
            None => {
                debug!(
                    endpoint = %endpoint.name,
                    "No request body template configured; passing input through"
                );
                let mut passthrough = request.filtered_input();
                if let Some(tracked) = &conversation {
                    if !passthrough.contains_key(&tracked.field) {
                        if let Some(value) = context.get(&tracked.field) {
                            passthrough.insert(tracked.field.clone(), value.clone());
                        }
                    }
                }
                Value::Object(passthrough)
            }
        };

        let mut query: Vec<(String, String)> = endpoint
            .query_params
            .iter()
            .map(|(name, value)| {
                (
                    name.clone(),
                    self.context.renderer.render_text(value, &mut context),
                )
            })
            .collect();

        let body = match method {
            Method::GET | Method::DELETE => {
                query.extend(query_pairs(&payload));
                None
            }
            _ => Some(&payload),
        };

        let snapshot = RequestSnapshot {
            protocol: ProtocolKind::Rest,
            method: Some(method.to_string()),
            url: url.clone(),
            headers: self.context.headers.sanitize(&headers),
            body: body.map(|b| self.context.headers.sanitize_value(b)),
        };

        debug!(endpoint = %endpoint.name, method = %method, url = %url, "Invoking REST endpoint");

        let retry = &self.context.settings.retry;
        let mut attempt: u32 = 0;
        let (status, response_headers, response_body) = loop {
            match self.attempt(&method, &url, &query, &headers, body).await {
                Ok(parts) => break parts,
                Err(e) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts {
                        warn!(
                            endpoint = %endpoint.name,
                            attempts = attempt,
                            error = %e,
                            "Endpoint unreachable, giving up"
                        );
                        let error = ErrorResponse::builder(ErrorKind::NetworkError)
                            .message("The endpoint could not be reached")
                            .technical(format!(
                                "Transport failure after {} attempts: {}",
                                attempt, e
                            ))
                            .request(snapshot)
                            .build();
                        return Ok(InvocationResult::failure(error));
                    }
                    let backoff = retry.backoff_for(attempt - 1);
                    warn!(
                        endpoint = %endpoint.name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transport failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        if !status.is_success() {
            debug!(endpoint = %endpoint.name, status = %status, "Endpoint returned an error status");
            let error = ErrorResponse::builder(ErrorKind::HttpError)
                .message(format!("Endpoint returned HTTP {}", status.as_u16()))
                .technical(format!("{} {} returned status {}", method, url, status))
                .request(snapshot)
                .diagnostics(ProtocolDiagnostics::Http {
                    status_code: status.as_u16(),
                    reason: status.canonical_reason().map(str::to_string),
                    headers: self.context.headers.sanitize(&response_headers),
                    body: Some(response_body),
                })
                .build();
            return Ok(InvocationResult::failure(error));
        }

        if endpoint.response_format == ResponseFormat::Text {
            debug!(endpoint = %endpoint.name, status = %status, "REST invocation complete (text body)");
            let mut output = Map::new();
            output.insert("output".to_string(), Value::String(response_body));
            return Ok(InvocationResult::success(output));
        }

        if response_body.trim().is_empty() {
            let error = ErrorResponse::builder(ErrorKind::JsonParsingError)
                .message("The endpoint returned an empty response body")
                .technical(format!(
                    "Expected a JSON body but the response was empty (HTTP {})",
                    status.as_u16()
                ))
                .request(snapshot)
                .diagnostics(ProtocolDiagnostics::Http {
                    status_code: status.as_u16(),
                    reason: status.canonical_reason().map(str::to_string),
                    headers: self.context.headers.sanitize(&response_headers),
                    body: Some(response_body),
                })
                .build();
            return Ok(InvocationResult::failure(error));
        }

        let parsed: Value = match serde_json::from_str(&response_body) {
            Ok(value) => value,
            Err(e) => {
                let error = ErrorResponse::builder(ErrorKind::JsonParsingError)
                    .message("The endpoint response was not valid JSON")
                    .technical(format!("Failed to parse response body: {}", e))
                    .request(snapshot)
                    .diagnostics(ProtocolDiagnostics::Http {
                        status_code: status.as_u16(),
                        reason: status.canonical_reason().map(str::to_string),
                        headers: self.context.headers.sanitize(&response_headers),
                        body: Some(response_body),
                    })
                    .build();
                return Ok(InvocationResult::failure(error));
            }
        };

        let output = if endpoint.response_mappings.is_empty() {
            match parsed {
                Value::Object(fields) => fields,
                other => {
                    let mut output = Map::new();
                    output.insert("output".to_string(), other);
                    output
                }
            }
        } else {
            self.context
                .mapper
                .apply(&endpoint.response_mappings, &parsed)
        };

        debug!(endpoint = %endpoint.name, status = %status, "REST invocation complete");
        Ok(InvocationResult::success(output))
    }

    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Rest
    }
}

/// Parse the configured method against the supported dispatch set
///
/// An absent method means POST; anything outside the set is a configuration
/// error because the endpoint cannot be driven.
fn parse_method(configured: Option<&str>) -> InvokerResult<Method> {
    match configured {
        None => Ok(Method::POST),
        Some(raw) => match raw.to_uppercase().as_str() {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            other => Err(InvokerError::configuration(format!(
                "Unsupported HTTP method '{}'",
                other
            ))),
        },
    }
}

/// Join base URL and path, avoiding duplicate slashes
fn build_url(endpoint: &EndpointConfig) -> InvokerResult<String> {
    let mut url = endpoint.base_url.trim_end_matches('/').to_string();
    if let Some(path) = endpoint.path.as_deref().filter(|p| !p.is_empty()) {
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);
    }
    url::Url::parse(&url)
        .map_err(|e| InvokerError::configuration(format!("Invalid endpoint URL '{}': {}", url, e)))?;
    Ok(url)
}

/// Top-level fields of a rendered payload as query parameters
///
/// Scalars are carried verbatim, structured values JSON-encoded, nulls
/// dropped.
fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    let fields = match payload.as_object() {
        Some(fields) => fields,
        None => return Vec::new(),
    };
    fields
        .iter()
        .filter_map(|(name, value)| {
            let rendered = match value {
                Value::Null => return None,
                Value::String(text) => text.clone(),
                Value::Number(_) | Value::Bool(_) => value.to_string(),
                structured => serde_json::to_string(structured).ok()?,
            };
            Some((name.clone(), rendered))
        })
        .collect()
}

/// Case-insensitive presence check on an owned header map
fn contains_header(headers: &HashMap<String, String>, name: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(name))
}

fn flatten_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_dispatch_table() {
        assert_eq!(parse_method(None).unwrap(), Method::POST);
        assert_eq!(parse_method(Some("get")).unwrap(), Method::GET);
        assert_eq!(parse_method(Some("PUT")).unwrap(), Method::PUT);
        assert_eq!(parse_method(Some("Delete")).unwrap(), Method::DELETE);
        assert!(parse_method(Some("PATCH")).is_err());
        assert!(parse_method(Some("TRACE")).is_err());
    }

    #[test]
    fn test_url_join() {
        let mut endpoint =
            EndpointConfig::new("e", ProtocolKind::Rest, "https://api.example.com/");
        endpoint.path = Some("/v1/chat".to_string());
        assert_eq!(build_url(&endpoint).unwrap(), "https://api.example.com/v1/chat");

        endpoint.path = Some("v1/chat".to_string());
        assert_eq!(build_url(&endpoint).unwrap(), "https://api.example.com/v1/chat");

        endpoint.path = None;
        assert_eq!(build_url(&endpoint).unwrap(), "https://api.example.com");
    }

    #[test]
    fn test_url_join_rejects_garbage() {
        let endpoint = EndpointConfig::new("e", ProtocolKind::Rest, "not a url");
        assert!(build_url(&endpoint).is_err());
    }

    #[test]
    fn test_query_pairs_from_payload() {
        let pairs = query_pairs(&json!({
            "q": "hello world",
            "limit": 5,
            "verbose": true,
            "skip_me": null,
            "filter": {"lang": "en"}
        }));

        let lookup: HashMap<_, _> = pairs.into_iter().collect();
        assert_eq!(lookup["q"], "hello world");
        assert_eq!(lookup["limit"], "5");
        assert_eq!(lookup["verbose"], "true");
        assert_eq!(lookup["filter"], r#"{"lang":"en"}"#);
        assert!(!lookup.contains_key("skip_me"));
    }

    #[test]
    fn test_query_pairs_ignore_non_object_payload() {
        assert!(query_pairs(&json!("just text")).is_empty());
        assert!(query_pairs(&json!(null)).is_empty());
    }
}
