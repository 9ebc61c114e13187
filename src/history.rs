//! Append-only record of applied changesets, plus the pure comparisons made against it.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::changelog::{ChangeLog, ChangeSet, ChangeSetId, RunMode};
use crate::dialect::Dialect;
use crate::error::Error;

pub const DEFAULT_HISTORY_TABLE_NAME: &str = "_revisio_history_";

/// How a history row came to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    Executed,
    Reran,
    MarkRan,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Executed => "EXECUTED",
            ExecType::Reran => "RERAN",
            ExecType::MarkRan => "MARK_RAN",
        }
    }

    fn from_column(value: &str) -> Result<Self, Error> {
        match value {
            "EXECUTED" => Ok(ExecType::Executed),
            "RERAN" => Ok(ExecType::Reran),
            "MARK_RAN" => Ok(ExecType::MarkRan),
            other => Err(Error::Generic(format!("unknown exec_type '{}'", other))),
        }
    }
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the history table.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub author: String,
    pub filename: String,
    pub date_executed: DateTime<Utc>,
    pub order_executed: i64,
    pub exec_type: ExecType,
    pub checksum: String,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub tag: Option<String>,
    pub contexts: Option<String>,
    pub labels: Option<String>,
    pub deployment_id: String,
    pub applied_by: Option<String>,
}

impl HistoryRecord {
    pub fn identity(&self) -> ChangeSetId {
        ChangeSetId::new(&self.id, &self.author, &self.filename)
    }

    fn from_row(row: &Row<'_>) -> Result<Self, Error> {
        let date_executed: String = row.get(3)?;
        let date_executed = DateTime::parse_from_rfc3339(&date_executed)
            .map_err(|e| Error::Generic(format!("invalid date_executed: {}", e)))?
            .to_utc();
        let exec_type: String = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            author: row.get(1)?,
            filename: row.get(2)?,
            date_executed,
            order_executed: row.get(4)?,
            exec_type: ExecType::from_column(&exec_type)?,
            checksum: row.get(6)?,
            description: row.get(7)?,
            comments: row.get(8)?,
            tag: row.get(9)?,
            contexts: row.get(10)?,
            labels: row.get(11)?,
            deployment_id: row.get(12)?,
            applied_by: row.get(13)?,
        })
    }
}

const COLUMNS: &str = "id, author, filename, date_executed, order_executed, exec_type, checksum, \
     description, comments, tag, contexts, labels, deployment_id, applied_by";

/// Reads and writes the history table through a [Dialect].
pub struct HistoryStore<'a> {
    dialect: &'a dyn Dialect,
    schema: Option<&'a str>,
    table: &'a str,
}

impl<'a> HistoryStore<'a> {
    pub fn new(dialect: &'a dyn Dialect, schema: Option<&'a str>, table: &'a str) -> Self {
        Self {
            dialect,
            schema,
            table,
        }
    }

    pub fn table_name(&self) -> &str {
        self.table
    }

    fn qualified(&self) -> String {
        self.dialect.qualify(self.schema, self.table)
    }

    pub fn exists(&self, conn: &Connection) -> Result<bool, Error> {
        self.dialect.table_exists(conn, self.schema, self.table)
    }

    /// Create the table if missing. Returns whether it already existed.
    pub fn ensure_table(&self, conn: &Connection) -> Result<bool, Error> {
        let existed = self.exists(conn)?;
        if !existed {
            // IF NOT EXISTS covers a concurrent creator that bypassed the lock
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (\
                     id TEXT NOT NULL, \
                     author TEXT NOT NULL, \
                     filename TEXT NOT NULL, \
                     date_executed TEXT NOT NULL, \
                     order_executed INTEGER NOT NULL, \
                     exec_type TEXT NOT NULL, \
                     checksum TEXT NOT NULL, \
                     description TEXT, \
                     comments TEXT, \
                     tag TEXT, \
                     contexts TEXT, \
                     labels TEXT, \
                     deployment_id TEXT NOT NULL, \
                     applied_by TEXT)",
                    self.qualified()
                ),
                [],
            )?;
            tracing::debug!(table = %self.qualified(), "Created history table");
        }
        Ok(existed)
    }

    /// All rows in execution order. Empty when the table does not exist yet.
    pub fn records(&self, conn: &Connection) -> Result<Vec<HistoryRecord>, Error> {
        if !self.exists(conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY order_executed",
            COLUMNS,
            self.qualified()
        ))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(HistoryRecord::from_row(row)?);
        }
        Ok(records)
    }

    /// Append a row for `change_set`. Intended to run inside the changeset's transaction.
    pub fn record_applied(
        &self,
        conn: &Connection,
        change_set: &ChangeSet,
        exec_type: ExecType,
        deployment_id: &str,
        applied_by: &str,
    ) -> Result<HistoryRecord, Error> {
        let order_executed: i64 = conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(order_executed), 0) + 1 FROM {}",
                self.qualified()
            ),
            [],
            |row| row.get(0),
        )?;
        let record = HistoryRecord {
            id: change_set.id.clone(),
            author: change_set.author.clone(),
            filename: change_set.file_path.clone(),
            date_executed: Utc::now(),
            order_executed,
            exec_type,
            checksum: change_set.checksum().to_string(),
            description: Some(change_set.description()).filter(|d| !d.is_empty()),
            comments: change_set.comment.clone(),
            tag: change_set.tag().map(str::to_string),
            contexts: change_set.context.clone(),
            labels: Some(
                change_set
                    .labels
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(","),
            )
            .filter(|l| !l.is_empty()),
            deployment_id: deployment_id.to_string(),
            applied_by: Some(applied_by.to_string()),
        };
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                self.qualified(),
                COLUMNS
            ),
            params![
                record.id,
                record.author,
                record.filename,
                record.date_executed.to_rfc3339(),
                record.order_executed,
                record.exec_type.as_str(),
                record.checksum,
                record.description,
                record.comments,
                record.tag,
                record.contexts,
                record.labels,
                record.deployment_id,
                record.applied_by,
            ],
        )?;
        Ok(record)
    }

    /// Delete every row for `identity`. Returns the number of rows removed.
    pub fn remove(&self, conn: &Connection, identity: &ChangeSetId) -> Result<usize, Error> {
        Ok(conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND author = ?2 AND filename = ?3",
                self.qualified()
            ),
            params![identity.id, identity.author, identity.file_path],
        )?)
    }

    /// The delete statement [HistoryStore::remove] runs, with literals inlined for SQL output.
    pub fn remove_sql(&self, identity: &ChangeSetId) -> String {
        format!(
            "DELETE FROM {} WHERE id = {} AND author = {} AND filename = {}",
            self.qualified(),
            self.dialect.quote_literal(&identity.id),
            self.dialect.quote_literal(&identity.author),
            self.dialect.quote_literal(&identity.file_path)
        )
    }

    /// Set `tag` on the most recently executed row.
    pub fn tag_last(&self, conn: &Connection, tag: &str) -> Result<(), Error> {
        let updated = conn.execute(
            &format!(
                "UPDATE {table} SET tag = ?1 WHERE order_executed = \
                 (SELECT MAX(order_executed) FROM {table})",
                table = self.qualified()
            ),
            [tag],
        )?;
        if updated == 0 {
            return Err(Error::Generic(format!(
                "cannot tag '{}': no changesets have been applied",
                tag
            )));
        }
        Ok(())
    }

    pub fn tag_exists(&self, conn: &Connection, tag: &str) -> Result<bool, Error> {
        if !self.exists(conn)? {
            return Ok(false);
        }
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE tag = ?1 LIMIT 1", self.qualified()),
                [tag],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// The latest row for each identity. Later rows supersede earlier ones.
pub fn latest_by_identity(history: &[HistoryRecord]) -> HashMap<ChangeSetId, &HistoryRecord> {
    let mut latest: HashMap<ChangeSetId, &HistoryRecord> = HashMap::new();
    for record in history {
        match latest.get(&record.identity()) {
            Some(existing) if existing.order_executed > record.order_executed => {}
            _ => {
                latest.insert(record.identity(), record);
            }
        }
    }
    latest
}

/// Changesets that a forward run would execute, in changelog order, before any filtering.
pub fn pending_changesets<'c>(
    changelog: &'c ChangeLog,
    history: &[HistoryRecord],
) -> Vec<&'c ChangeSet> {
    let latest = latest_by_identity(history);
    changelog
        .change_sets()
        .iter()
        .filter(|cs| match latest.get(&cs.identity()) {
            None => true,
            Some(record) => match cs.run_mode {
                RunMode::Once => false,
                RunMode::Always => true,
                RunMode::OnChange => record.checksum != cs.checksum(),
            },
        })
        .collect()
}

/// Fail on the first run-once changeset whose recorded checksum is no longer accepted.
/// Rows for identities missing from the changelog are only logged.
pub fn validate(changelog: &ChangeLog, history: &[HistoryRecord]) -> Result<(), Error> {
    let latest = latest_by_identity(history);
    for change_set in changelog.change_sets() {
        if change_set.run_mode != RunMode::Once {
            continue;
        }
        if let Some(record) = latest.get(&change_set.identity()) {
            if !change_set.accepts_checksum(&record.checksum) {
                return Err(Error::ChecksumMismatch {
                    changeset: change_set.identity().to_string(),
                    recorded: record.checksum.clone(),
                    computed: change_set.checksum().to_string(),
                });
            }
        }
    }
    let known: HashSet<ChangeSetId> = changelog
        .change_sets()
        .iter()
        .map(|cs| cs.identity())
        .collect();
    for identity in latest.keys().filter(|id| !known.contains(*id)) {
        tracing::warn!(
            changeset = %identity,
            "History contains a changeset that is not in the changelog"
        );
    }
    Ok(())
}
