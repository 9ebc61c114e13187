//! Testing utilities for changelog development and verification.
//!
//! This module provides a test harness for applying a changelog step by step, asserting on
//! the resulting schema, and checking that rollbacks restore it.

use std::collections::HashMap;

use rusqlite::{Connection, Row};
use serde::{Deserialize, Serialize};

use crate::changelog::{ChangeLog, ChangeSetId};
use crate::error::Error;
use crate::migrator::{Migrator, RunContext, UpdateReport};

/// A test harness that applies a [ChangeLog] to a database and provides assertion helpers.
///
/// # Example
///
/// ```
/// # #[cfg(not(feature = "testing"))]
/// # fn main() {}
/// # #[cfg(feature = "testing")]
/// # fn main() {
/// use revisio::changelog::ChangeLogParser;
/// use revisio::resource::MemoryResourceAccessor;
/// use revisio::testing::ChangeLogTestHarness;
/// use revisio::{Error, Migrator};
///
/// # fn test() -> Result<(), Error> {
/// let accessor = MemoryResourceAccessor::new().with(
///     "master.yaml",
///     r#"
/// databaseChangeLog:
///   - changeSet:
///       id: "1"
///       author: alice
///       changes:
///         - createTable:
///             tableName: users
///             columns:
///               - column: { name: id, type: INTEGER, constraints: { primaryKey: true } }
///               - column: { name: name, type: TEXT }
/// "#,
/// );
/// let changelog = ChangeLogParser::new(&accessor).parse("master.yaml")?;
/// let mut harness = ChangeLogTestHarness::new(changelog, Migrator::new())?;
///
/// harness.update()?;
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
///
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
/// # Ok(())
/// # }
/// # test().unwrap();
/// # }
/// ```
pub struct ChangeLogTestHarness {
    conn: Connection,
    changelog: ChangeLog,
    migrator: Migrator,
}

/// Represents a captured database schema for comparison and snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: HashMap<String, TableSchema>,
    /// View name to its defining SQL.
    pub views: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
}

fn assertion(message: String) -> Error {
    Error::Generic(message)
}

impl ChangeLogTestHarness {
    /// Create a harness over an in-memory database.
    pub fn new(changelog: ChangeLog, migrator: Migrator) -> Result<Self, Error> {
        Ok(Self::with_connection(
            Connection::open_in_memory()?,
            changelog,
            migrator,
        ))
    }

    /// Create a harness over an existing connection, e.g. a file-based database.
    pub fn with_connection(conn: Connection, changelog: ChangeLog, migrator: Migrator) -> Self {
        Self {
            conn,
            changelog,
            migrator,
        }
    }

    /// Apply every pending changeset.
    pub fn update(&mut self) -> Result<UpdateReport, Error> {
        self.update_with(&RunContext::default())
    }

    pub fn update_with(&mut self, ctx: &RunContext) -> Result<UpdateReport, Error> {
        self.migrator.update(&mut self.conn, &self.changelog, ctx)
    }

    /// Apply pending changesets up to and including the one tagging `tag`.
    pub fn update_to_tag(&mut self, tag: &str) -> Result<UpdateReport, Error> {
        self.update_with(&RunContext::default().with_tag(tag))
    }

    pub fn rollback_to_tag(&mut self, tag: &str) -> Result<Vec<ChangeSetId>, Error> {
        self.migrator
            .rollback_to_tag(&mut self.conn, &self.changelog, tag, &RunContext::default())
    }

    /// Identities recorded in history, in execution order.
    pub fn applied(&mut self) -> Result<Vec<ChangeSetId>, Error> {
        Ok(self
            .migrator
            .history(&mut self.conn)?
            .iter()
            .map(|record| record.identity())
            .collect())
    }

    /// Update to `tag`, snapshot, update fully, roll back to `tag`, and check the snapshot
    /// is restored.
    pub fn assert_rollback_restores(&mut self, tag: &str) -> Result<(), Error> {
        self.update_to_tag(tag)?;
        let before = self.capture_schema()?;
        self.update()?;
        self.rollback_to_tag(tag)?;
        self.assert_schema_matches(&before)
    }

    /// Execute a SQL statement (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute(sql, [])?;
        Ok(())
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    pub fn assert_table_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if !self.migrator.dialect().table_exists(&self.conn, None, table_name)? {
            return Err(assertion(format!("Table '{}' does not exist", table_name)));
        }
        Ok(())
    }

    pub fn assert_table_not_exists(&mut self, table_name: &str) -> Result<(), Error> {
        if self.migrator.dialect().table_exists(&self.conn, None, table_name)? {
            return Err(assertion(format!(
                "Table '{}' exists but should not",
                table_name
            )));
        }
        Ok(())
    }

    pub fn assert_column_exists(&mut self, table_name: &str, column_name: &str) -> Result<(), Error> {
        if !self
            .migrator
            .dialect()
            .column_exists(&self.conn, None, table_name, column_name)?
        {
            return Err(assertion(format!(
                "Column '{}' does not exist in table '{}'",
                column_name, table_name
            )));
        }
        Ok(())
    }

    pub fn assert_index_exists(&mut self, index_name: &str) -> Result<(), Error> {
        if !self.migrator.dialect().index_exists(&self.conn, None, index_name)? {
            return Err(assertion(format!("Index '{}' does not exist", index_name)));
        }
        Ok(())
    }

    pub fn assert_view_exists(&mut self, view_name: &str) -> Result<(), Error> {
        if !self.migrator.dialect().view_exists(&self.conn, None, view_name)? {
            return Err(assertion(format!("View '{}' does not exist", view_name)));
        }
        Ok(())
    }

    /// Capture user tables and views, leaving out the history and lock tables.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        let objects: Vec<(String, String, Option<String>)> = self
            .conn
            .prepare(
                "SELECT type, name, sql FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' AND name NOT IN (?1, ?2)",
            )?
            .query_map(
                [self.migrator.history_table(), self.migrator.lock_table()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut snapshot = SchemaSnapshot {
            tables: HashMap::new(),
            views: HashMap::new(),
        };
        for (kind, name, sql) in objects {
            if kind == "view" {
                snapshot.views.insert(name, sql.unwrap_or_default());
            } else {
                let table = TableSchema {
                    columns: self.columns(&name)?,
                    indexes: self.indexes(&name)?,
                };
                snapshot.tables.insert(name, table);
            }
        }
        Ok(snapshot)
    }

    /// Assert that the current schema matches a previously captured snapshot.
    pub fn assert_schema_matches(&mut self, expected: &SchemaSnapshot) -> Result<(), Error> {
        let actual = self.capture_schema()?;
        if actual == *expected {
            return Ok(());
        }

        let mut differences = Vec::new();
        let mut names: Vec<&String> = expected.tables.keys().chain(actual.tables.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            match (expected.tables.get(name), actual.tables.get(name)) {
                (Some(_), None) => differences.push(format!("  - Table '{}' is missing", name)),
                (None, Some(_)) => {
                    differences.push(format!("  - Unexpected table '{}' found", name))
                }
                (Some(e), Some(a)) if e != a => differences.push(format!(
                    "  - Table '{}' differs:\n    Expected: {:?}\n    Actual:   {:?}",
                    name, e, a
                )),
                _ => {}
            }
        }
        let mut views: Vec<&String> = expected.views.keys().chain(actual.views.keys()).collect();
        views.sort();
        views.dedup();
        for name in views {
            if expected.views.get(name) != actual.views.get(name) {
                differences.push(format!("  - View '{}' differs", name));
            }
        }
        Err(assertion(format!(
            "Schema mismatch detected:\n{}",
            differences.join("\n")
        )))
    }

    fn columns(&mut self, table_name: &str) -> Result<Vec<ColumnInfo>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1)",
        )?;
        let columns = stmt
            .query_map([table_name], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    type_name: row.get(1)?,
                    not_null: row.get::<_, i32>(2)? != 0,
                    default_value: row.get(3)?,
                    primary_key: row.get::<_, i32>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn indexes(&mut self, table_name: &str) -> Result<Vec<IndexInfo>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT name, \"unique\" FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name",
        )?;
        let indexes = stmt
            .query_map([table_name], |row| {
                Ok(IndexInfo {
                    name: row.get(0)?,
                    unique: row.get::<_, i32>(1)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(indexes)
    }

    /// Get a reference to the underlying connection for advanced usage.
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLogParser;
    use crate::resource::MemoryResourceAccessor;

    const CHANGELOG: &str = r#"
databaseChangeLog:
  - changeSet:
      id: users
      author: alice
      changes:
        - createTable:
            tableName: users
            columns:
              - column: { name: id, type: INTEGER, constraints: { primaryKey: true } }
              - column: { name: name, type: TEXT, constraints: { nullable: false } }
  - changeSet:
      id: v1
      author: alice
      changes:
        - tagDatabase: { tag: v1 }
  - changeSet:
      id: email
      author: bob
      changes:
        - addColumn:
            tableName: users
            columns:
              - column: { name: email, type: TEXT }
        - createIndex:
            indexName: idx_users_email
            tableName: users
            unique: true
            columns:
              - column: { name: email }
  - changeSet:
      id: names
      author: bob
      changes:
        - createView:
            viewName: user_names
            selectQuery: SELECT name FROM users
"#;

    fn harness() -> ChangeLogTestHarness {
        let accessor = MemoryResourceAccessor::new().with("master.yaml", CHANGELOG);
        let changelog = ChangeLogParser::new(&accessor).parse("master.yaml").unwrap();
        ChangeLogTestHarness::new(changelog, Migrator::new()).unwrap()
    }

    #[test]
    fn update_to_tag_then_rest() {
        let mut harness = harness();
        harness.update_to_tag("v1").unwrap();
        harness.assert_table_exists("users").unwrap();
        assert!(harness.assert_column_exists("users", "email").is_err());

        harness.update().unwrap();
        harness.assert_column_exists("users", "email").unwrap();
        harness.assert_index_exists("idx_users_email").unwrap();
        harness.assert_view_exists("user_names").unwrap();
        let applied: Vec<String> = harness
            .applied()
            .unwrap()
            .into_iter()
            .map(|id| id.id)
            .collect();
        assert_eq!(applied, vec!["users", "v1", "email", "names"]);
    }

    #[test]
    fn rollback_restores_tagged_schema() {
        let mut harness = harness();
        harness.assert_rollback_restores("v1").unwrap();
        harness.assert_table_exists("users").unwrap();
        assert_eq!(harness.applied().unwrap().len(), 2);
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let mut harness = harness();
        harness.update_to_tag("v1").unwrap();
        let snapshot = harness.capture_schema().unwrap();
        assert!(!snapshot.tables.contains_key(crate::DEFAULT_HISTORY_TABLE_NAME));
        harness.execute("CREATE TABLE extra (id INTEGER)").unwrap();
        match harness.assert_schema_matches(&snapshot) {
            Err(Error::Generic(message)) => assert!(message.contains("Unexpected table 'extra'")),
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn query_helpers() {
        let mut harness = harness();
        harness.update().unwrap();
        harness
            .execute("INSERT INTO users (id, name, email) VALUES (1, 'alice', 'a@example.com')")
            .unwrap();
        harness
            .execute("INSERT INTO users (id, name, email) VALUES (2, 'bob', NULL)")
            .unwrap();
        let names: Vec<String> = harness
            .query_all("SELECT name FROM user_names ORDER BY name")
            .unwrap();
        assert_eq!(names, vec!["alice", "bob"]);
        let emails = harness
            .query_map("SELECT id, email FROM users ORDER BY id", |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .unwrap();
        assert_eq!(emails[1], (2, None));
        harness.assert_table_not_exists("orders").unwrap();
    }
}
