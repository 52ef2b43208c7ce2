//! Shared type definitions for the AI-PROBE platform
//!
//! These types cross service boundaries: the endpoint store persists
//! `EndpointConfig` records, the test scheduler builds `InvocationRequest`s,
//! and the invoker service answers with `InvocationResult`s.

pub mod endpoint;
pub mod invocation;

pub use endpoint::{
    Credentials, EndpointConfig, ProtocolKind, ResponseFormat, TokenCache,
};
pub use invocation::{
    ErrorKind, ErrorResponse, ErrorResponseBuilder, InvocationRequest, InvocationResult,
    ProtocolDiagnostics, RequestSnapshot, ORGANIZATION_ID_KEY, USER_ID_KEY,
};
