//! Error handling for the invoker service
//!
//! Runtime invocation failures are data: they travel inside
//! `InvocationResult::Error` so a batch test run keeps going when one call
//! fails. `InvokerError` covers only configuration-level failures, the kind
//! that make the endpoint unusable before a request can even be built, and
//! those are raised to the caller immediately.

use thiserror::Error;

/// Result type alias for invoker operations
pub type InvokerResult<T> = Result<T, InvokerError>;

/// Configuration-level failures raised by the invoker service
#[derive(Error, Debug)]
pub enum InvokerError {
    /// Endpoint configuration makes the call impossible to build
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Token endpoint could not issue a token for a credential flow
    #[error("Token exchange error: {message}")]
    TokenExchange { message: String },
}

impl InvokerError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new token exchange error
    pub fn token_exchange<S: Into<String>>(message: S) -> Self {
        Self::TokenExchange {
            message: message.into(),
        }
    }
}
