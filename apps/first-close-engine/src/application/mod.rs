//! Application Layer - Workers and port definitions.
//!
//! This layer contains the engine's services and the port interfaces
//! through which they reach the broker and the symbol source.

/// Port interfaces for external systems (market feed, quote REST, symbol files).
pub mod ports;

/// Engine workers, shared state and orchestration.
pub mod services;
