//! Symbol Identity
//!
//! A tradable symbol is identified by its exchange segment and the exchange
//! token. The pair, joined by `|`, is the key used everywhere else: in the
//! store, in feed subscriptions, and in the in-memory maps.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator between exchange and token in a [`SymbolKey`].
pub const KEY_SEPARATOR: char = '|';

/// Key of a symbol: `exchange|token`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolKey(String);

impl SymbolKey {
    /// Build a key from its parts.
    #[must_use]
    pub fn new(exchange: &str, token: &str) -> Self {
        Self(format!("{exchange}{KEY_SEPARATOR}{token}"))
    }

    /// Wrap an already joined key (as read back from the store).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The joined key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the key back into `(exchange, token)`.
    #[must_use]
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0.split_once(KEY_SEPARATOR)
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tradable symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Exchange segment (e.g. `NSE`, `MCX`).
    pub exchange: String,
    /// Exchange token.
    pub token: String,
    /// Human readable trading symbol.
    pub display_symbol: String,
}

impl Symbol {
    /// Create a symbol; an empty display symbol falls back to the token.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        token: impl Into<String>,
        display_symbol: impl Into<String>,
    ) -> Self {
        let token = token.into();
        let display_symbol = display_symbol.into();
        let display_symbol = if display_symbol.is_empty() {
            token.clone()
        } else {
            display_symbol
        };
        Self {
            exchange: exchange.into(),
            token,
            display_symbol,
        }
    }

    /// Key of this symbol.
    #[must_use]
    pub fn key(&self) -> SymbolKey {
        SymbolKey::new(&self.exchange, &self.token)
    }
}

/// The symbol universe, ordered by key.
pub type SymbolMap = BTreeMap<SymbolKey, Symbol>;

/// Parse one line of a symbol description file.
///
/// The first two non-empty comma separated fields are the exchange and the
/// token. The fourth raw field, when present and non-empty, is the display
/// symbol. Blank lines and header lines return `None`.
#[must_use]
pub fn parse_symbol_line(line: &str) -> Option<Symbol> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    let mut non_empty = fields.iter().copied().filter(|f| !f.is_empty());
    let exchange = non_empty.next()?;
    let token = non_empty.next()?;

    if exchange.eq_ignore_ascii_case("exchange") {
        return None;
    }

    let display = fields.get(3).copied().unwrap_or_default();
    Some(Symbol::new(exchange, token, display))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn key_joins_exchange_and_token() {
        let key = SymbolKey::new("NSE", "22");
        assert_eq!(key.as_str(), "NSE|22");
        assert_eq!(key.parts(), Some(("NSE", "22")));
    }

    #[test_case("NSE,22,1,ACC-EQ,ACC,EQ,0.05", "NSE", "22", "ACC-EQ" ; "full line")]
    #[test_case("NSE,22", "NSE", "22", "22" ; "display defaults to token")]
    #[test_case("NSE,22,1,,ACC", "NSE", "22", "22" ; "empty fourth field")]
    #[test_case(" MCX , 2345 ,1, GOLD ", "MCX", "2345", "GOLD" ; "whitespace trimmed")]
    #[test_case(",NSE,22", "NSE", "22", "22" ; "leading empty field skipped")]
    fn parses_symbol_lines(line: &str, exchange: &str, token: &str, display: &str) {
        let symbol = parse_symbol_line(line).unwrap();
        assert_eq!(symbol.exchange, exchange);
        assert_eq!(symbol.token, token);
        assert_eq!(symbol.display_symbol, display);
    }

    #[test_case("" ; "empty")]
    #[test_case("   " ; "blank")]
    #[test_case("NSE" ; "single field")]
    #[test_case("Exchange,Token,LotSize,Symbol" ; "header")]
    fn rejects_unusable_lines(line: &str) {
        assert!(parse_symbol_line(line).is_none());
    }
}
