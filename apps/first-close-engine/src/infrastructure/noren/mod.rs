//! Noren Broker Adapters
//!
//! Implements the REST session, historical quote and streaming feed ports
//! against a Noren-style broker API.
//!
//! # Modules
//!
//! - `messages`: request bodies, reply decoding and feed frames
//! - `rest`: login, session attachment and one-minute bar windows
//! - `feed`: WebSocket tick stream with reconnect and resubscribe

pub mod feed;
pub mod messages;
pub mod rest;

pub use feed::{FeedClientError, NorenFeed, NorenFeedConfig, NorenFeedConnector};
pub use rest::{NorenQuoteSource, NorenRestConfig, NorenSessionFactory};
