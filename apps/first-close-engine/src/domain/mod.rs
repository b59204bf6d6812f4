//! Domain Layer - Symbols, market clock and first-close records.
//!
//! Pure value types and state transitions. Nothing in here performs I/O.

/// Market wall clock and target slots.
pub mod market;

/// First closes, history walk cursor and raw ticks.
pub mod records;

/// Published snapshot document.
pub mod snapshot;

/// Symbol identity and parsing.
pub mod symbol;

pub use market::{MarketClock, Slot, minute_of_day, previous_day};
pub use records::{BackfillLimits, BackfillState, Bar, FirstCloseRecord, FirstCloses, TickRecord};
pub use snapshot::{Snapshot, SnapshotRow};
pub use symbol::{Symbol, SymbolKey, SymbolMap, parse_symbol_line};
