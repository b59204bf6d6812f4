//! Configuration Module
//!
//! Environment-driven configuration for the engine and its adapters.

mod settings;

pub use settings::{
    BrokerCredentials, ConfigError, EngineConfig, FeedSettings, MarketSettings,
    SupervisorSettings,
};
