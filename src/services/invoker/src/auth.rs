//! Credential resolution and token exchange
//!
//! Static bearer tokens pass through untouched. Client-credentials endpoints
//! go through a token cache: the persisted cache on the endpoint record is
//! tried first, then a process-wide cache guarded by a per-endpoint mutex so
//! concurrent invocations of the same endpoint share one exchange instead of
//! racing the token endpoint. Refreshed tokens are handed back to the caller
//! for persistence, never written into the endpoint record here.

use crate::error::{InvokerError, InvokerResult};
use ai_probe_shared::types::{Credentials, EndpointConfig, TokenCache};
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Seconds subtracted from the issued lifetime so a token is refreshed
/// before the endpoint would reject it
const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;

/// Issued lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Token endpoint response per RFC 6749 §5.1
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Outcome of resolving credentials for one invocation
#[derive(Debug, Clone)]
pub struct ResolvedToken {
    /// Token to place in the Authorization header
    pub access_token: String,
    /// Newer cache value than the endpoint record carries, for the caller
    /// to persist
    pub refreshed: Option<TokenCache>,
}

/// Resolves endpoint credentials to a sendable access token
pub struct TokenManager {
    http: reqwest::Client,
    cache: DashMap<Uuid, Arc<Mutex<Option<TokenCache>>>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: DashMap::new(),
        }
    }

    /// Resolve the endpoint's credentials
    ///
    /// Returns `None` for unauthenticated endpoints. For client-credentials
    /// endpoints the result carries a `refreshed` cache value whenever the
    /// token did not come from the endpoint record itself.
    pub async fn resolve(
        &self,
        endpoint: &EndpointConfig,
    ) -> InvokerResult<Option<ResolvedToken>> {
        match &endpoint.credentials {
            Credentials::None => Ok(None),
            Credentials::BearerToken { token } => Ok(Some(ResolvedToken {
                access_token: token.clone(),
                refreshed: None,
            })),
            Credentials::ClientCredentials {
                client_id,
                client_secret,
                token_url,
                scopes,
                audience,
                extra_params,
            } => {
                if let Some(cached) = &endpoint.token_cache {
                    if cached.is_valid() {
                        debug!(endpoint_id = %endpoint.id, "Using persisted access token");
                        return Ok(Some(ResolvedToken {
                            access_token: cached.access_token.clone(),
                            refreshed: None,
                        }));
                    }
                }

                let slot = self
                    .cache
                    .entry(endpoint.id)
                    .or_insert_with(|| Arc::new(Mutex::new(None)))
                    .clone();
                let mut guard = slot.lock().await;

                // A concurrent invocation may have refreshed while we waited
                if let Some(cached) = guard.as_ref() {
                    if cached.is_valid() {
                        debug!(endpoint_id = %endpoint.id, "Using in-process access token");
                        return Ok(Some(ResolvedToken {
                            access_token: cached.access_token.clone(),
                            refreshed: Some(cached.clone()),
                        }));
                    }
                }

                let fresh = self
                    .exchange(
                        endpoint.id,
                        token_url,
                        client_id,
                        client_secret,
                        scopes,
                        audience.as_deref(),
                        extra_params,
                    )
                    .await?;
                *guard = Some(fresh.clone());
                Ok(Some(ResolvedToken {
                    access_token: fresh.access_token.clone(),
                    refreshed: Some(fresh),
                }))
            }
        }
    }

    /// Freshest in-process cache entry for an endpoint
    ///
    /// Hosts poll this after invocations to persist refreshed tokens next to
    /// the endpoint record.
    pub async fn latest(&self, endpoint_id: Uuid) -> Option<TokenCache> {
        let slot = self.cache.get(&endpoint_id)?.clone();
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Perform the client-credentials exchange against the token endpoint
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        endpoint_id: Uuid,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
        audience: Option<&str>,
        extra_params: &HashMap<String, String>,
    ) -> InvokerResult<TokenCache> {
        let mut form: Vec<(String, String)> = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id.to_string()),
            ("client_secret".to_string(), client_secret.to_string()),
        ];
        if !scopes.is_empty() {
            form.push(("scope".to_string(), scopes.join(" ")));
        }
        if let Some(aud) = audience {
            form.push(("audience".to_string(), aud.to_string()));
        }
        for (key, value) in extra_params {
            form.push((key.clone(), value.clone()));
        }

        debug!(endpoint_id = %endpoint_id, token_url = %token_url, "Requesting access token");

        let response = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                InvokerError::token_exchange(format!("Token endpoint unreachable: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(endpoint_id = %endpoint_id, status = %status, "Token endpoint rejected the exchange");
            return Err(InvokerError::token_exchange(format!(
                "Token endpoint returned status {}",
                status.as_u16()
            )));
        }

        let body: TokenEndpointResponse = response.json().await.map_err(|e| {
            InvokerError::token_exchange(format!(
                "Token endpoint returned an unparseable body: {}",
                e
            ))
        })?;

        let expires_in = body.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let usable = (expires_in as i64 - EXPIRY_SAFETY_MARGIN_SECS).max(0);
        info!(endpoint_id = %endpoint_id, expires_in, "Access token refreshed");

        Ok(TokenCache::new(
            body.access_token,
            Utc::now() + chrono::Duration::seconds(usable),
        ))
    }
}
