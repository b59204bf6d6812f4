//! Persistence Store
//!
//! Single-file SQLite database in WAL mode holding:
//!
//! | Table | Key | Writes |
//! |-------|-----|--------|
//! | `first_closes` | `(symbol, day)` | upsert, never overwrites a known close |
//! | `history_state` | `symbol` | upsert, seeded with insert-or-ignore |
//! | `ticks` | rowid | append only |
//!
//! Every multi-row write runs inside one transaction. The connection sits
//! behind a mutex, so writers are serialized; callers batch their commits.

mod snapshot;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, Statement, params};

pub use snapshot::{SnapshotError, SnapshotWriter, write_atomic};

use crate::domain::{
    BackfillState, FirstCloseRecord, FirstCloses, SymbolKey, SymbolMap, TickRecord,
};

const DAY_FORMAT: &str = "%Y-%m-%d";
const TICK_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wait for a locked database before failing a statement.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS first_closes (
    symbol TEXT NOT NULL,
    day TEXT NOT NULL,
    exchange TEXT NOT NULL,
    token TEXT NOT NULL,
    display_symbol TEXT NOT NULL,
    close_1m REAL,
    close_5m REAL,
    close_15m REAL,
    fetch_done INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (symbol, day)
);
CREATE INDEX IF NOT EXISTS idx_first_closes_day ON first_closes(day);

CREATE TABLE IF NOT EXISTS history_state (
    symbol TEXT PRIMARY KEY,
    next_day TEXT NOT NULL,
    empty_streak INTEGER NOT NULL DEFAULT 0,
    lookback_days INTEGER NOT NULL DEFAULT 0,
    retries INTEGER NOT NULL DEFAULT 0,
    done INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_state_pending ON history_state(done, updated_at);

CREATE TABLE IF NOT EXISTS ticks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    received_ts TEXT NOT NULL,
    exchange TEXT NOT NULL,
    token TEXT NOT NULL,
    last_price REAL,
    feed_time INTEGER,
    tick_time TEXT NOT NULL
);
";

const UPSERT_RECORD: &str = r"
INSERT INTO first_closes
    (symbol, day, exchange, token, display_symbol, close_1m, close_5m, close_15m, fetch_done, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(symbol, day) DO UPDATE SET
    display_symbol = excluded.display_symbol,
    close_1m = COALESCE(first_closes.close_1m, excluded.close_1m),
    close_5m = COALESCE(first_closes.close_5m, excluded.close_5m),
    close_15m = COALESCE(first_closes.close_15m, excluded.close_15m),
    fetch_done = MAX(first_closes.fetch_done, excluded.fetch_done),
    updated_at = excluded.updated_at
";

const UPSERT_STATE: &str = r"
INSERT INTO history_state
    (symbol, next_day, empty_streak, lookback_days, retries, done, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(symbol) DO UPDATE SET
    next_day = excluded.next_day,
    empty_streak = excluded.empty_streak,
    lookback_days = excluded.lookback_days,
    retries = excluded.retries,
    done = excluded.done,
    updated_at = excluded.updated_at
";

const SELECT_STATE: &str =
    "SELECT symbol, next_day, empty_streak, lookback_days, retries, done, updated_at FROM history_state";

const SELECT_RECORD: &str =
    "SELECT symbol, day, close_1m, close_5m, close_15m, fetch_done, updated_at FROM first_closes";

/// Store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A write running on the blocking pool did not finish.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A stored value could not be decoded.
    #[error("corrupt {column} value: {value}")]
    Corrupt {
        /// Column name.
        column: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Handle to the SQLite database.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::debug!(mode = %mode, "WAL journal mode unavailable");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // first_closes
    // =========================================================================

    /// Upsert records in one transaction.
    ///
    /// A close already stored is never replaced and `fetch_done` never goes
    /// back from `true` to `false`.
    pub fn upsert_records(
        &self,
        records: &[FirstCloseRecord],
        symbols: &SymbolMap,
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert_records_tx(&tx, records, symbols)?;
        tx.commit()?;
        Ok(records.len())
    }

    /// All records of one day.
    pub fn load_records_for_day(&self, day: NaiveDate) -> Result<Vec<FirstCloseRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SELECT_RECORD} WHERE day = ?1 ORDER BY symbol"))?;
        let rows = stmt.query_map(params![format_day(day)], RawRecord::from_row)?;
        rows.map(|row| row?.decode()).collect()
    }

    /// One record, if stored.
    pub fn load_record(
        &self,
        symbol: &SymbolKey,
        day: NaiveDate,
    ) -> Result<Option<FirstCloseRecord>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_RECORD} WHERE symbol = ?1 AND day = ?2"),
                params![symbol.as_str(), format_day(day)],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    // =========================================================================
    // history_state
    // =========================================================================

    /// Insert states for symbols without one. Returns the number inserted.
    pub fn seed_backfill_states(&self, states: &[BackfillState]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO history_state
                    (symbol, next_day, empty_streak, lookback_days, retries, done, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for state in states {
                inserted += execute_state(&mut stmt, state)?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Up to `limit` unfinished states, least recently updated first.
    pub fn load_backfill_batch(&self, limit: usize) -> Result<Vec<BackfillState>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_STATE} WHERE done = 0 ORDER BY updated_at ASC, symbol ASC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawState::from_row)?;
        rows.map(|row| row?.decode()).collect()
    }

    /// Number of unfinished states.
    pub fn count_pending_backfill(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM history_state WHERE done = 0", [], |row| {
                row.get(0)
            })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Upsert states in one transaction.
    pub fn save_backfill_states(&self, states: &[BackfillState]) -> Result<(), StoreError> {
        self.write_backfill_cycle(&[], &SymbolMap::new(), states)
    }

    /// Commit one backfill cycle: found closes and updated cursors together.
    pub fn write_backfill_cycle(
        &self,
        records: &[FirstCloseRecord],
        symbols: &SymbolMap,
        states: &[BackfillState],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert_records_tx(&tx, records, symbols)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT_STATE)?;
            for state in states {
                execute_state(&mut stmt, state)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One state, if stored.
    pub fn load_backfill_state(
        &self,
        symbol: &SymbolKey,
    ) -> Result<Option<BackfillState>, StoreError> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("{SELECT_STATE} WHERE symbol = ?1"),
                params![symbol.as_str()],
                RawState::from_row,
            )
            .optional()?;
        raw.map(RawState::decode).transpose()
    }

    // =========================================================================
    // ticks
    // =========================================================================

    /// Append ticks in one transaction.
    pub fn append_ticks(&self, ticks: &[TickRecord]) -> Result<usize, StoreError> {
        if ticks.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO ticks (received_ts, exchange, token, last_price, feed_time, tick_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for tick in ticks {
                stmt.execute(params![
                    format_instant(tick.received_ts),
                    tick.exchange,
                    tick.token,
                    tick.last_price,
                    tick.feed_time,
                    tick.tick_time.format(TICK_TIME_FORMAT).to_string(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(ticks.len())
    }

    /// Number of logged ticks.
    pub fn tick_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM ticks", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Logged ticks in insertion order.
    pub fn load_ticks(&self) -> Result<Vec<TickRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT received_ts, exchange, token, last_price, feed_time, tick_time
             FROM ticks ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        rows.map(|row| {
            let (received_ts, exchange, token, last_price, feed_time, tick_time) = row?;
            Ok(TickRecord {
                received_ts: parse_instant("received_ts", &received_ts)?,
                exchange,
                token,
                last_price,
                feed_time,
                tick_time: NaiveDateTime::parse_from_str(&tick_time, TICK_TIME_FORMAT).map_err(
                    |_| StoreError::Corrupt {
                        column: "tick_time",
                        value: tick_time,
                    },
                )?,
            })
        })
        .collect()
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn upsert_records_tx(
    tx: &rusqlite::Transaction<'_>,
    records: &[FirstCloseRecord],
    symbols: &SymbolMap,
) -> Result<(), StoreError> {
    if records.is_empty() {
        return Ok(());
    }
    let mut stmt = tx.prepare_cached(UPSERT_RECORD)?;
    for record in records {
        let (exchange, token) = record.symbol.parts().unwrap_or((record.symbol.as_str(), ""));
        let display = symbols
            .get(&record.symbol)
            .map_or(token, |symbol| symbol.display_symbol.as_str());
        stmt.execute(params![
            record.symbol.as_str(),
            format_day(record.day),
            exchange,
            token,
            display,
            record.closes.close_1m,
            record.closes.close_5m,
            record.closes.close_15m,
            record.fetch_done,
            format_instant(record.updated_at),
        ])?;
    }
    Ok(())
}

fn execute_state(stmt: &mut Statement<'_>, state: &BackfillState) -> rusqlite::Result<usize> {
    stmt.execute(params![
        state.symbol.as_str(),
        format_day(state.next_day),
        state.empty_streak,
        state.lookback_days,
        state.retries,
        state.done,
        format_instant(state.updated_at),
    ])
}

fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

fn parse_day(column: &'static str, value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DAY_FORMAT).map_err(|_| StoreError::Corrupt {
        column,
        value: value.to_string(),
    })
}

// Fixed-width so that text ordering matches time ordering.
fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_instant(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column,
            value: value.to_string(),
        })
}

struct RawRecord {
    symbol: String,
    day: String,
    closes: FirstCloses,
    fetch_done: bool,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            day: row.get(1)?,
            closes: FirstCloses {
                close_1m: row.get(2)?,
                close_5m: row.get(3)?,
                close_15m: row.get(4)?,
            },
            fetch_done: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<FirstCloseRecord, StoreError> {
        Ok(FirstCloseRecord {
            symbol: SymbolKey::from_raw(self.symbol),
            day: parse_day("day", &self.day)?,
            closes: self.closes,
            fetch_done: self.fetch_done,
            updated_at: parse_instant("updated_at", &self.updated_at)?,
        })
    }
}

struct RawState {
    symbol: String,
    next_day: String,
    empty_streak: u32,
    lookback_days: u32,
    retries: u32,
    done: bool,
    updated_at: String,
}

impl RawState {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            next_day: row.get(1)?,
            empty_streak: row.get(2)?,
            lookback_days: row.get(3)?,
            retries: row.get(4)?,
            done: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<BackfillState, StoreError> {
        Ok(BackfillState {
            symbol: SymbolKey::from_raw(self.symbol),
            next_day: parse_day("next_day", &self.next_day)?,
            empty_streak: self.empty_streak,
            lookback_days: self.lookback_days,
            retries: self.retries,
            done: self.done,
            updated_at: parse_instant("updated_at", &self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Symbol;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn symbols() -> SymbolMap {
        let symbol = Symbol::new("NSE", "22", "ACC-EQ");
        SymbolMap::from([(symbol.key(), symbol)])
    }

    fn record(closes: FirstCloses, fetch_done: bool) -> FirstCloseRecord {
        FirstCloseRecord {
            symbol: SymbolKey::new("NSE", "22"),
            day: day(5),
            closes,
            fetch_done,
            updated_at: at(0),
        }
    }

    #[test]
    fn upsert_never_replaces_known_closes() {
        let store = Store::open_in_memory().unwrap();
        let first = record(
            FirstCloses {
                close_1m: Some(1.0),
                ..Default::default()
            },
            false,
        );
        store.upsert_records(&[first], &symbols()).unwrap();

        let second = record(
            FirstCloses {
                close_1m: Some(9.0),
                close_5m: Some(5.0),
                close_15m: None,
            },
            false,
        );
        store.upsert_records(&[second], &symbols()).unwrap();

        let stored = store
            .load_record(&SymbolKey::new("NSE", "22"), day(5))
            .unwrap()
            .unwrap();
        assert_eq!(stored.closes.close_1m, Some(1.0));
        assert_eq!(stored.closes.close_5m, Some(5.0));
        assert_eq!(stored.closes.close_15m, None);
    }

    #[test]
    fn fetch_done_does_not_regress() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_records(&[record(FirstCloses::default(), true)], &symbols())
            .unwrap();
        store
            .upsert_records(&[record(FirstCloses::default(), false)], &symbols())
            .unwrap();
        let stored = store.load_records_for_day(day(5)).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].fetch_done);
    }

    #[test]
    fn seeding_is_insert_or_ignore() {
        let store = Store::open_in_memory().unwrap();
        let key = SymbolKey::new("NSE", "22");
        let mut state = BackfillState::seed(key.clone(), day(6), at(0));
        assert_eq!(store.seed_backfill_states(&[state.clone()]).unwrap(), 1);

        state.retries = 2;
        store.save_backfill_states(&[state.clone()]).unwrap();
        assert_eq!(
            store
                .seed_backfill_states(&[BackfillState::seed(key.clone(), day(6), at(5))])
                .unwrap(),
            0
        );
        assert_eq!(store.load_backfill_state(&key).unwrap(), Some(state));
    }

    #[test]
    fn batch_prefers_least_recently_updated() {
        let store = Store::open_in_memory().unwrap();
        let mut older = BackfillState::seed(SymbolKey::new("NSE", "2"), day(6), at(10));
        let newer = BackfillState::seed(SymbolKey::new("NSE", "1"), day(6), at(20));
        let mut finished = BackfillState::seed(SymbolKey::new("NSE", "3"), day(6), at(0));
        finished.done = true;
        older.retries = 1;
        store
            .seed_backfill_states(&[newer, older.clone(), finished])
            .unwrap();

        let batch = store.load_backfill_batch(1).unwrap();
        assert_eq!(batch, vec![older]);
        assert_eq!(store.count_pending_backfill().unwrap(), 2);
    }

    #[test]
    fn ticks_append_in_order() {
        let store = Store::open_in_memory().unwrap();
        let tick = |price: f64| TickRecord {
            received_ts: at(1),
            exchange: "NSE".to_string(),
            token: "22".to_string(),
            last_price: Some(price),
            feed_time: Some(1_700_000_001),
            tick_time: day(5).and_hms_opt(9, 15, 0).unwrap(),
        };
        assert_eq!(store.append_ticks(&[tick(1.0), tick(2.0)]).unwrap(), 2);
        assert_eq!(store.append_ticks(&[]).unwrap(), 0);
        assert_eq!(store.tick_count().unwrap(), 2);
        assert_eq!(store.load_ticks().unwrap(), vec![tick(1.0), tick(2.0)]);
    }

    #[test]
    fn records_and_cursors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first_closes.db");
        let updated_at = DateTime::from_timestamp(1_709_610_300, 123_456_789).unwrap();
        let record = FirstCloseRecord {
            symbol: SymbolKey::new("NSE", "22"),
            day: day(5),
            closes: FirstCloses {
                close_1m: Some(101.25),
                close_5m: Some(102.5),
                close_15m: Some(99.75),
            },
            fetch_done: true,
            updated_at,
        };
        let state = BackfillState {
            symbol: SymbolKey::new("NSE", "22"),
            next_day: day(1),
            empty_streak: 2,
            lookback_days: 4,
            retries: 1,
            done: true,
            updated_at,
        };

        {
            let store = Store::open(&path).unwrap();
            store
                .write_backfill_cycle(std::slice::from_ref(&record), &symbols(), std::slice::from_ref(&state))
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.load_record(&record.symbol, record.day).unwrap(), Some(record.clone()));
        assert_eq!(store.load_records_for_day(day(5)).unwrap(), vec![record]);
        assert_eq!(store.load_backfill_state(&state.symbol).unwrap(), Some(state));
    }
}
