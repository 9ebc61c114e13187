//! Cross-process mutual exclusion through a single row in a lock table.
//!
//! The row with `id = 1` is flipped from unlocked to locked with a conditional `UPDATE`, so
//! the database arbitrates between every process pointed at it. Waiters poll until their
//! timeout elapses.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::dialect::Dialect;
use crate::error::Error;

pub const DEFAULT_LOCK_TABLE_NAME: &str = "_revisio_lock_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
    Releasing,
}

/// How long to wait for the lock, and when to consider a held lock abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Reclaim locks held longer than this. `None` never reclaims.
    pub stale_after: Option<Duration>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            stale_after: None,
        }
    }
}

/// Current contents of the lock row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub locked: bool,
    pub locked_by: Option<String>,
    /// RFC 3339 timestamp, kept as written so it can be compared exactly.
    pub locked_at: Option<String>,
}

impl LockRecord {
    pub fn locked_at_time(&self) -> Option<DateTime<Utc>> {
        self.locked_at
            .as_deref()
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.to_utc())
    }
}

/// Identifies this process as a lock holder.
pub fn lock_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{} ({})", user, host, std::process::id())
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct LockManager<'a> {
    dialect: &'a dyn Dialect,
    schema: Option<&'a str>,
    table: &'a str,
    settings: LockSettings,
    owner: String,
    state: LockState,
}

impl<'a> LockManager<'a> {
    pub fn new(
        dialect: &'a dyn Dialect,
        schema: Option<&'a str>,
        table: &'a str,
        settings: LockSettings,
    ) -> Self {
        Self {
            dialect,
            schema,
            table,
            settings,
            owner: lock_owner(),
            state: LockState::Unlocked,
        }
    }

    /// Override the holder name written to the lock row.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn qualified(&self) -> String {
        self.dialect.qualify(self.schema, self.table)
    }

    /// Create the lock table and its single row if they do not exist.
    pub fn ensure_table(&self, conn: &Connection) -> Result<(), Error> {
        let table = self.qualified();
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id INTEGER PRIMARY KEY NOT NULL, \
                 locked INTEGER NOT NULL, \
                 locked_by TEXT, \
                 locked_at TEXT)",
                table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (id, locked, locked_by, locked_at) VALUES (1, 0, NULL, NULL)",
                table
            ),
            [],
        )?;
        Ok(())
    }

    pub fn current(&self, conn: &Connection) -> Result<LockRecord, Error> {
        Ok(conn.query_row(
            &format!(
                "SELECT locked, locked_by, locked_at FROM {} WHERE id = 1",
                self.qualified()
            ),
            [],
            |row| {
                Ok(LockRecord {
                    locked: row.get::<_, i64>(0)? != 0,
                    locked_by: row.get(1)?,
                    locked_at: row.get(2)?,
                })
            },
        )?)
    }

    /// Block until the lock is held or the timeout elapses.
    pub fn acquire(&mut self, conn: &Connection) -> Result<(), Error> {
        self.state = LockState::Acquiring;
        match self.acquire_inner(conn) {
            Ok(()) => {
                self.state = LockState::Locked;
                Ok(())
            }
            Err(e) => {
                self.state = LockState::Unlocked;
                Err(e)
            }
        }
    }

    fn acquire_inner(&self, conn: &Connection) -> Result<(), Error> {
        self.ensure_table(conn)?;
        let table = self.qualified();
        let started = Instant::now();
        loop {
            let updated = conn.execute(
                &format!(
                    "UPDATE {} SET locked = 1, locked_by = ?1, locked_at = ?2 WHERE id = 1 AND locked = 0",
                    table
                ),
                params![self.owner, now_timestamp()],
            )?;
            if updated == 1 {
                tracing::debug!(owner = %self.owner, "Acquired migration lock");
                return Ok(());
            }

            let holder = self.current(conn)?;
            if self.try_reclaim_stale(conn, &holder)? {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= self.settings.timeout {
                return Err(Error::LockTimeout {
                    waited_ms: waited.as_millis(),
                    locked_by: holder.locked_by.unwrap_or_default(),
                    locked_at: holder.locked_at.unwrap_or_default(),
                });
            }
            tracing::debug!(
                locked_by = ?holder.locked_by,
                locked_at = ?holder.locked_at,
                "Waiting for migration lock"
            );
            thread::sleep(
                self.settings
                    .poll_interval
                    .min(self.settings.timeout - waited),
            );
        }
    }

    /// Take over `holder` if it is older than the stale threshold. The update only succeeds
    /// when `locked_at` is still the value observed, so two reclaimers cannot both win.
    fn try_reclaim_stale(&self, conn: &Connection, holder: &LockRecord) -> Result<bool, Error> {
        let Some(stale_after) = self.settings.stale_after else {
            return Ok(false);
        };
        let (Some(observed), Some(locked_at)) = (holder.locked_at.as_deref(), holder.locked_at_time())
        else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(locked_at);
        if age.to_std().map(|age| age < stale_after).unwrap_or(true) {
            return Ok(false);
        }
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET locked = 1, locked_by = ?1, locked_at = ?2 \
                 WHERE id = 1 AND locked = 1 AND locked_at = ?3",
                self.qualified()
            ),
            params![self.owner, now_timestamp(), observed],
        )?;
        if updated == 1 {
            tracing::warn!(
                previous_holder = ?holder.locked_by,
                locked_at = observed,
                age_ms = age.num_milliseconds(),
                "StaleLockReclaimed: took over a migration lock past its stale threshold"
            );
        }
        Ok(updated == 1)
    }

    /// Release the lock. Called whatever the outcome of the run; only clears the row while
    /// this owner still holds it, so a lock taken over as stale stays with its new holder.
    pub fn release(&mut self, conn: &Connection) -> Result<(), Error> {
        let previous = self.state;
        self.state = LockState::Releasing;
        let cleared = conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL \
                 WHERE id = 1 AND locked_by = ?1",
                self.qualified()
            ),
            params![self.owner],
        );
        match cleared {
            Ok(0) => {
                self.state = LockState::Unlocked;
                tracing::warn!(
                    owner = %self.owner,
                    "Migration lock was no longer held by this owner at release"
                );
                Ok(())
            }
            Ok(_) => {
                self.state = LockState::Unlocked;
                tracing::debug!(owner = %self.owner, "Released migration lock");
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e.into())
            }
        }
    }

    /// Clear a lock left behind by another process.
    pub fn force_release(&mut self, conn: &Connection) -> Result<Option<LockRecord>, Error> {
        self.ensure_table(conn)?;
        let holder = self.current(conn)?;
        self.clear(conn)?;
        self.state = LockState::Unlocked;
        if holder.locked {
            tracing::warn!(locked_by = ?holder.locked_by, "Forcibly released migration lock");
            Ok(Some(holder))
        } else {
            Ok(None)
        }
    }

    fn clear(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute(
            &format!(
                "UPDATE {} SET locked = 0, locked_by = NULL, locked_at = NULL WHERE id = 1",
                self.qualified()
            ),
            [],
        )?;
        Ok(())
    }
}
