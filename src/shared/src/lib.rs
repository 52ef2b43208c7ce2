//! Shared types for the AI-PROBE platform

pub mod types;

// Export all types from types module
pub use types::*;
