//! Port Interfaces
//!
//! Contracts the engine needs from the outside world. Infrastructure
//! adapters implement them; tests substitute fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - `HistoricalQuoteSource` / `SessionFactory`: REST bars and sessions
//! - `FeedConnector` / `MarketDataFeed`: streaming ticks
//! - `SymbolSourceAcquirer`: symbol file download

mod market_data_port;
mod quote_source_port;
mod symbol_source_port;

pub use market_data_port::{
    FeedConnector, FeedError, FeedEvent, FeedHandle, FeedTick, MarketDataFeed,
};
#[cfg(test)]
pub use quote_source_port::MockSessionFactory;
pub use quote_source_port::{
    ErrorCategory, FetchError, HistoricalQuoteSource, SessionError, SessionFactory, SessionToken,
    categorize_status,
};
pub use symbol_source_port::{AcquireError, SymbolSourceAcquirer};
