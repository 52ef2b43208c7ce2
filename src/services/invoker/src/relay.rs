//! Redis relay for calls to clients connected elsewhere
//!
//! A detached client holds its connection to exactly one host process; any
//! other process reaching that client goes through the relay. The caller
//! subscribes to a result channel keyed by a fresh correlation id, then
//! publishes the call envelope onto the target client's call channel. The
//! host process owning the connection dispatches the call locally and
//! publishes the result back. Subscribing before publishing means the result
//! cannot slip past the caller.
//!
//! Key layout under the configured prefix:
//! - `<prefix>calls:<project_id>:<environment>`: call channel per client
//! - `<prefix>result:<correlation_id>`: result channel per in-flight call
//! - `<prefix>presence:<project_id>:<environment>`: presence key with TTL

use crate::config::RelaySettings;
use crate::error::{InvokerError, InvokerResult};
use crate::registry::{ClientKey, FunctionResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Call message published onto a client's call channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub correlation_id: Uuid,
    pub project_id: String,
    pub environment: String,
    pub function: String,
    pub arguments: Map<String, Value>,
}

/// Failure to complete a relayed call
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no process accepted the relayed call")]
    SendFailed,
    #[error("the relayed call was not answered within the dispatch timeout")]
    Timeout,
    #[error("relay transport failure: {0}")]
    Transport(String),
}

/// The invoker's view of the relay: presence checks and call round-trips
///
/// Implemented by [`RelayClient`].
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Whether any process currently holds a connection for the client
    async fn is_client_connected(&self, key: &ClientKey) -> Result<bool, RelayError>;

    /// Relay one call to the process owning the client connection
    async fn call(
        &self,
        key: &ClientKey,
        function: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<FunctionResult, RelayError>;
}

/// Client for the redis relay
#[derive(Clone)]
pub struct RelayClient {
    client: redis::Client,
    manager: ConnectionManager,
    key_prefix: String,
}

impl RelayClient {
    /// Connect to the relay broker named in the settings
    pub async fn connect(settings: &RelaySettings) -> InvokerResult<Self> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InvokerError::configuration("Relay URL is not configured"))?;
        let client = redis::Client::open(url)
            .map_err(|e| InvokerError::configuration(format!("Invalid relay URL: {}", e)))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| {
                InvokerError::configuration(format!("Relay broker unreachable: {}", e))
            })?;

        Ok(Self {
            client,
            manager,
            key_prefix: settings.key_prefix.clone(),
        })
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    fn presence_key(&self, key: &ClientKey) -> String {
        format!(
            "{}presence:{}:{}",
            self.key_prefix, key.project_id, key.environment
        )
    }

    fn call_channel(&self, key: &ClientKey) -> String {
        format!(
            "{}calls:{}:{}",
            self.key_prefix, key.project_id, key.environment
        )
    }

    fn result_channel(&self, correlation_id: Uuid) -> String {
        format!("{}result:{}", self.key_prefix, correlation_id)
    }

    /// Announce a locally held client connection; refreshed as a heartbeat
    pub async fn announce_client(&self, key: &ClientKey, ttl: Duration) -> Result<(), RelayError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(self.presence_key(key), 1u8, ttl.as_secs())
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Withdraw the presence announcement for a departed client
    pub async fn retract_client(&self, key: &ClientKey) -> Result<(), RelayError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(self.presence_key(key))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn is_client_connected(&self, key: &ClientKey) -> Result<bool, RelayError> {
        let mut conn = self.manager.clone();
        conn.exists(self.presence_key(key))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn call(
        &self,
        key: &ClientKey,
        function: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<FunctionResult, RelayError> {
        let correlation_id = Uuid::new_v4();
        let envelope = RelayEnvelope {
            correlation_id,
            project_id: key.project_id.clone(),
            environment: key.environment.clone(),
            function: function.to_string(),
            arguments,
        };
        let serialized = serde_json::to_string(&envelope)
            .map_err(|e| RelayError::Transport(format!("Failed to serialize call: {}", e)))?;

        // Subscribe first: the host may answer faster than we can re-enter
        // the event loop after publishing.
        let result_channel = self.result_channel(correlation_id);
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(&result_channel)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let call_channel = self.call_channel(key);
        let mut conn = self.manager.clone();
        let receivers: u32 = conn
            .publish(&call_channel, serialized)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        if receivers == 0 {
            warn!(
                channel = %call_channel,
                correlation_id = %correlation_id,
                "No host process subscribed to the call channel"
            );
            return Err(RelayError::SendFailed);
        }
        debug!(
            channel = %call_channel,
            correlation_id = %correlation_id,
            function = %function,
            "Relayed call published"
        );

        let mut stream = pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(message)) => {
                let payload: String = message
                    .get_payload()
                    .map_err(|e| RelayError::Transport(e.to_string()))?;
                serde_json::from_str(&payload).map_err(|e| {
                    RelayError::Transport(format!("Malformed relay result: {}", e))
                })
            }
            Ok(None) => Err(RelayError::Transport(
                "Relay subscription ended before a result arrived".to_string(),
            )),
            Err(_) => Err(RelayError::Timeout),
        }
    }
}
