//! Shared library for cross-cutting concerns in the Kubernetes secrets engine.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - Transport timeouts for outbound API clients
//! - Retry and bounded polling policies with exponential backoff
//! - Tracing subscriber initialization

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod http;
pub mod retry;
pub mod tracing_config;

pub use error::PlatformError;
pub use http::HttpConfig;
pub use retry::{RetryConfig, RetryPolicy, Retryable};
pub use tracing_config::{LogFormat, TracingConfig, init_tracing};
