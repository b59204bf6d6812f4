//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// HTTP download of symbol description files.
pub mod acquire;

/// Symbol universe loading and caching.
pub mod catalog;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Noren broker REST and WebSocket adapters.
pub mod noren;

/// SQLite persistence and the snapshot file.
pub mod store;

/// Tracing and OpenTelemetry integration.
pub mod telemetry;
