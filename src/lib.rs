//! # Revisio
//!
//! `revisio` applies declarative database changelogs. A changelog is an ordered list of
//! changesets, each identified by `(id, author, file)`. Applied changesets are recorded in a
//! history table with a checksum, so every run executes exactly what is pending, and a lock
//! row in the target database keeps concurrent processes from migrating at the same time.
//!
//! ## Example
//!
//! ```
//! use revisio::changelog::ChangeLogParser;
//! use revisio::resource::MemoryResourceAccessor;
//! use revisio::{Migrator, RunContext};
//! use rusqlite::Connection;
//!
//! let accessor = MemoryResourceAccessor::new().with(
//!     "db/master.yaml",
//!     r#"
//! databaseChangeLog:
//!   - changeSet:
//!       id: "1"
//!       author: alice
//!       changes:
//!         - createTable:
//!             tableName: users
//!             columns:
//!               - column: { name: id, type: INTEGER, constraints: { primaryKey: true } }
//!               - column: { name: name, type: TEXT }
//!   - changeSet:
//!       id: "2"
//!       author: alice
//!       changes:
//!         - addColumn:
//!             tableName: users
//!             columns:
//!               - column: { name: email, type: TEXT }
//! "#,
//! );
//!
//! // parse the changelog, resolving includes and properties
//! let changelog = ChangeLogParser::new(&accessor).parse("db/master.yaml").unwrap();
//!
//! // connect to your database and apply what is pending, receiving a report of the results
//! let mut conn = Connection::open_in_memory().unwrap();
//! let migrator = Migrator::new();
//! let report = migrator.update(&mut conn, &changelog, &RunContext::default()).unwrap();
//! assert_eq!(report.change_sets_run.len(), 2);
//!
//! // a second run finds nothing to do
//! let report = migrator.update(&mut conn, &changelog, &RunContext::default()).unwrap();
//! assert!(report.change_sets_run.is_empty());
//!
//! // assert the changes were applied to the database
//! let mut stmt = conn.prepare("PRAGMA table_info(users)").unwrap();
//! let columns = stmt
//!     .query_map([], |row| Ok(row.get::<_, String>(1).unwrap()))
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name", "email"]);
//! ```
//!
//! ## Startup
//!
//! [listener::StartupListener] runs every configured target when an application starts,
//! using [config::MigrationConfigs] loaded from YAML or JSON.
//!
//! ## Tracing
//!
//! Runs emit `tracing` spans per update and per changeset, with events for each decision.
//! Install any subscriber to see them.

pub mod changelog;
pub mod config;
pub mod dialect;
mod error;
pub mod filter;
pub mod history;
pub mod listener;
pub mod lock;
mod migrator;
pub mod resource;
pub mod rollback;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use changelog::{ChangeLog, ChangeSet, ChangeSetId, RunMode};
pub use error::Error;
pub use history::{ExecType, HistoryRecord, DEFAULT_HISTORY_TABLE_NAME};
pub use lock::{LockSettings, LockState, DEFAULT_LOCK_TABLE_NAME};
pub use migrator::{Migrator, Plan, RunContext, UpdateReport};
