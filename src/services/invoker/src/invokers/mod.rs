//! Protocol invokers
//!
//! One invoker per wire protocol, all behind the [`Invoker`] trait. The
//! [`InvokerFactory`] selects an implementation from the endpoint's declared
//! protocol. [`InvokerContext`] carries what every protocol shares: the HTTP
//! client, token manager, template renderer, response mapper, header
//! handling, the injected connection registry, and the optional relay client.

pub mod relay;
pub mod rest;
pub mod stream;

pub use relay::RelayInvoker;
pub use rest::RestInvoker;
pub use stream::StreamInvoker;

use crate::auth::{ResolvedToken, TokenManager};
use crate::config::InvokerSettings;
use crate::conversation::{self, ConversationContext};
use crate::error::{InvokerError, InvokerResult};
use crate::headers::HeaderManager;
use crate::mapping::ResponseMapper;
use crate::registry::ConnectionRegistry;
use crate::relay::RelayTransport;
use crate::template::TemplateRenderer;
use ai_probe_shared::types::{
    EndpointConfig, InvocationRequest, InvocationResult, ProtocolKind,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// A protocol-specific endpoint invoker
///
/// Runtime failures come back inside the `InvocationResult`; `Err` is
/// reserved for configuration-level problems that make the endpoint unusable.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> InvokerResult<InvocationResult>;

    /// Protocol this invoker speaks
    fn protocol(&self) -> ProtocolKind;
}

/// Machinery shared by every protocol invoker
///
/// Cheap to clone; all heavy members are reference-counted. Safe for
/// concurrent invocations of different endpoints.
#[derive(Clone)]
pub struct InvokerContext {
    pub(crate) settings: Arc<InvokerSettings>,
    pub(crate) http: reqwest::Client,
    pub(crate) tokens: Arc<TokenManager>,
    pub(crate) renderer: TemplateRenderer,
    pub(crate) mapper: ResponseMapper,
    pub(crate) headers: HeaderManager,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) relay: Option<Arc<dyn RelayTransport>>,
    pub(crate) worker_mode: bool,
}

impl InvokerContext {
    fn new(settings: InvokerSettings) -> InvokerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http.request_timeout))
            .connect_timeout(Duration::from_secs(settings.http.connect_timeout))
            .user_agent(settings.http.user_agent.clone())
            .build()
            .map_err(|e| {
                InvokerError::configuration(format!("Failed to build HTTP client: {}", e))
            })?;

        let worker_mode = settings.relay.worker_mode;
        Ok(Self {
            settings: Arc::new(settings),
            tokens: Arc::new(TokenManager::new(http.clone())),
            http,
            renderer: TemplateRenderer::new(),
            mapper: ResponseMapper::new(),
            headers: HeaderManager::new(),
            registry: ConnectionRegistry::new(),
            relay: None,
            worker_mode,
        })
    }

    pub(crate) async fn resolve_token(
        &self,
        endpoint: &EndpointConfig,
    ) -> InvokerResult<Option<ResolvedToken>> {
        self.tokens.resolve(endpoint).await
    }

    /// Conversation tracking field in play for this endpoint, if any
    ///
    /// The caller's value for the field comes from the input under the field
    /// name, falling back to the externally supplied session id.
    pub(crate) fn conversation_for(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> Option<ConversationContext> {
        let field = conversation::detect_tracking_field(&endpoint.response_mappings)?;
        let value = request
            .input
            .get(&field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| request.session_id.clone());
        Some(ConversationContext::new(field, value))
    }

    /// Assemble the template render context
    ///
    /// Identity keys win over caller input; request mappings then bind each
    /// template variable to its configured input key; a known conversation
    /// value fills the tracking field unless the input already carries one.
    pub(crate) fn render_context(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
        conversation: Option<&ConversationContext>,
    ) -> Map<String, Value> {
        let mut context = request.context_map();
        for (template_var, input_key) in &endpoint.request_mappings {
            if let Some(value) = request.input.get(input_key) {
                context.insert(template_var.clone(), value.clone());
            }
        }
        if let Some(tracked) = conversation {
            if let Some(value) = &tracked.value {
                context
                    .entry(tracked.field.clone())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
        context
    }

    /// Round-trip ceiling shared by local dispatch and the relay
    pub(crate) fn dispatch_timeout(&self) -> Duration {
        self.settings.relay.dispatch_timeout_duration()
    }
}

/// Builds the right invoker for an endpoint
#[derive(Clone)]
pub struct InvokerFactory {
    context: InvokerContext,
}

impl InvokerFactory {
    pub fn new(settings: InvokerSettings) -> InvokerResult<Self> {
        Ok(Self {
            context: InvokerContext::new(settings)?,
        })
    }

    /// Use the registry of client connections held by this process
    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.context.registry = registry;
        self
    }

    /// Use a connected relay transport for out-of-process dispatch
    pub fn with_relay<T: RelayTransport + 'static>(mut self, relay: T) -> Self {
        self.context.relay = Some(Arc::new(relay));
        self
    }

    /// Mark this process as a background worker without local connections
    pub fn worker_mode(mut self, enabled: bool) -> Self {
        self.context.worker_mode = enabled;
        self
    }

    /// Select the invoker for the endpoint's protocol
    pub fn create(&self, endpoint: &EndpointConfig) -> Box<dyn Invoker> {
        match endpoint.protocol {
            ProtocolKind::Rest => Box::new(RestInvoker::new(self.context.clone())),
            ProtocolKind::Stream => Box::new(StreamInvoker::new(self.context.clone())),
            ProtocolKind::Relay => Box::new(RelayInvoker::new(self.context.clone())),
        }
    }

    /// Create the invoker and run one invocation
    pub async fn invoke(
        &self,
        endpoint: &EndpointConfig,
        request: &InvocationRequest,
    ) -> InvokerResult<InvocationResult> {
        self.create(endpoint).invoke(endpoint, request).await
    }

    /// Freshest token cache for an endpoint, for the host to persist
    ///
    /// Token refresh never mutates the endpoint record; this is how a newer
    /// cache value reaches the endpoint store.
    pub async fn token_cache_for(
        &self,
        endpoint_id: uuid::Uuid,
    ) -> Option<ai_probe_shared::types::TokenCache> {
        self.context.tokens.latest(endpoint_id).await
    }
}
