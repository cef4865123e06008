//! SQLite-backed usage store

use std::path::Path;
use std::sync::Mutex;

use chrono::NaiveDate;
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::error::{DispatchError, Result};
use crate::lock_or_recover;
use crate::usage::{LedgerStore, UsageRecord};

/// Daily usage rows keyed by (user, day, provider)
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedgerStore").finish_non_exhaustive()
    }
}

fn storage_error(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Storage(e.to_string())
}

fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl SqliteLedgerStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let conn = Connection::open(path).map_err(storage_error)?;
        info!("Opened usage database at {:?}", path);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(storage_error)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage_daily (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                provider TEXT NOT NULL,
                tokens INTEGER NOT NULL DEFAULT 0,
                cost_usd REAL NOT NULL DEFAULT 0,
                requests INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day, provider)
            )",
            [],
        )
        .map_err(storage_error)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_daily_day ON usage_daily(day)",
            [],
        )
        .map_err(storage_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&self, record: &UsageRecord) -> Result<()> {
        let conn = lock_or_recover(&self.conn);
        conn.execute(
            "INSERT INTO usage_daily (user_id, day, provider, tokens, cost_usd, requests)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id, day, provider) DO UPDATE SET
                tokens = tokens + excluded.tokens,
                cost_usd = cost_usd + excluded.cost_usd,
                requests = requests + excluded.requests",
            params![
                record.user_id,
                record.day.to_string(),
                record.provider,
                to_sql_int(record.tokens),
                record.cost_usd,
                to_sql_int(record.requests),
            ],
        )
        .map_err(storage_error)?;
        debug!(
            "Persisted usage: user={} provider={} day={}",
            record.user_id, record.provider, record.day
        );
        Ok(())
    }

    fn load_since(&self, since: NaiveDate) -> Result<Vec<UsageRecord>> {
        let conn = lock_or_recover(&self.conn);
        let mut stmt = conn
            .prepare(
                "SELECT user_id, day, provider, tokens, cost_usd, requests
                 FROM usage_daily WHERE day >= ?1 ORDER BY day",
            )
            .map_err(storage_error)?;

        let rows = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(storage_error)?;

        let mut records = Vec::new();
        for row in rows {
            let (user_id, day, provider, tokens, cost_usd, requests) = row.map_err(storage_error)?;
            let day = day
                .parse::<NaiveDate>()
                .map_err(|e| storage_error(format!("bad day '{}' in usage_daily: {}", day, e)))?;
            records.push(UsageRecord {
                user_id,
                provider,
                day,
                tokens: u64::try_from(tokens).unwrap_or(0),
                cost_usd,
                requests: u64::try_from(requests).unwrap_or(0),
            });
        }
        Ok(records)
    }

    fn prune_before(&self, before: NaiveDate) -> Result<()> {
        let conn = lock_or_recover(&self.conn);
        let removed = conn
            .execute(
                "DELETE FROM usage_daily WHERE day < ?1",
                params![before.to_string()],
            )
            .map_err(storage_error)?;
        if removed > 0 {
            debug!("Pruned {} usage rows before {}", removed, before);
        }
        Ok(())
    }
}
