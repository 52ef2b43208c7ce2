//! In-process registry of connected SDK clients
//!
//! Detached clients hold a long-lived connection to exactly one process.
//! That process registers a `ClientConnection` here under the client's
//! project/environment key; invocations landing on the same process dispatch
//! calls straight through the connection's channel instead of the relay.
//!
//! The registry is handed to the invoker factory by the host process. It is
//! cheaply cloneable and safe to share across tasks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Identity of a detached client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey {
    pub project_id: String,
    pub environment: String,
}

impl ClientKey {
    pub fn new(project_id: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            environment: environment.into(),
        }
    }
}

/// One named-function call dispatched to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Correlates the eventual result with the waiting invocation
    pub correlation_id: Uuid,
    /// Function name registered by the client
    pub function: String,
    /// Arguments object passed to the function
    pub arguments: Map<String, Value>,
}

/// Terminal status of a dispatched call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The function ran and produced output
    Completed,
    /// The function raised or the client reported a failure
    Error,
    /// A downstream worker gave up waiting on the client
    Timeout,
    /// A downstream worker could not hand the call to the client
    SendFailed,
}

/// Result reported by a client for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResult {
    pub status: CallStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock duration observed by whichever process ran the call
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl FunctionResult {
    pub fn completed(output: Value, duration_ms: u64) -> Self {
        Self {
            status: CallStatus::Completed,
            output: Some(output),
            error: None,
            duration_ms: Some(duration_ms),
        }
    }

    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: CallStatus::Error,
            output: None,
            error: Some(message.into()),
            duration_ms: Some(duration_ms),
        }
    }
}

/// Failure to complete a locally dispatched call
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("the client connection is no longer accepting calls")]
    SendFailed,
    #[error("the client did not answer within the dispatch timeout")]
    Timeout,
}

/// A live connection to one detached client
///
/// The transport task owns the receiving half returned by [`ClientConnection::new`]
/// and forwards each [`FunctionCall`] to the client; results coming back on
/// the wire are posted with [`ClientConnection::complete`].
pub struct ClientConnection {
    key: ClientKey,
    sender: mpsc::UnboundedSender<FunctionCall>,
    pending: DashMap<Uuid, oneshot::Sender<FunctionResult>>,
    connected_at: DateTime<Utc>,
}

impl ClientConnection {
    pub fn new(key: ClientKey) -> (Arc<Self>, mpsc::UnboundedReceiver<FunctionCall>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            key,
            sender,
            pending: DashMap::new(),
            connected_at: Utc::now(),
        });
        (connection, receiver)
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Calls currently waiting on a result
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Dispatch a call and wait for its result
    pub async fn call(
        &self,
        function: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<FunctionResult, CallError> {
        let correlation_id = Uuid::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        self.pending.insert(correlation_id, result_tx);

        let call = FunctionCall {
            correlation_id,
            function: function.to_string(),
            arguments,
        };
        if self.sender.send(call).is_err() {
            self.pending.remove(&correlation_id);
            return Err(CallError::SendFailed);
        }
        debug!(
            correlation_id = %correlation_id,
            function = %function,
            project_id = %self.key.project_id,
            "Dispatched call to local client"
        );

        match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(result)) => Ok(result),
            // Sender dropped: the connection was torn down mid-call
            Ok(Err(_)) => {
                self.pending.remove(&correlation_id);
                Err(CallError::SendFailed)
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Post a result arriving from the client
    ///
    /// Returns false when no call is waiting under the correlation id, which
    /// happens after a timeout already released the caller.
    pub fn complete(&self, correlation_id: Uuid, result: FunctionResult) -> bool {
        match self.pending.remove(&correlation_id) {
            Some((_, waiter)) => waiter.send(result).is_ok(),
            None => {
                debug!(correlation_id = %correlation_id, "Result arrived for an abandoned call");
                false
            }
        }
    }
}

/// Registry of client connections held by this process
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<ClientKey, Arc<ClientConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, displacing any previous one for the same key
    pub fn register(&self, connection: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        let key = connection.key().clone();
        info!(
            project_id = %key.project_id,
            environment = %key.environment,
            "SDK client connected"
        );
        self.connections.insert(key, connection)
    }

    pub fn remove(&self, key: &ClientKey) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.remove(key).map(|(_, conn)| conn);
        if removed.is_some() {
            info!(
                project_id = %key.project_id,
                environment = %key.environment,
                "SDK client disconnected"
            );
        }
        removed
    }

    pub fn get(&self, key: &ClientKey) -> Option<Arc<ClientConnection>> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &ClientKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
