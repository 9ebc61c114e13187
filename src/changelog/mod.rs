//! In-memory changelog model.

mod change;
mod parser;

pub use change::{
    AddColumn, Change, ColumnConstraints, ColumnDefinition, ColumnEntry, ColumnValue, CreateIndex,
    CreateTable, CreateView, Delete, DropColumn, DropIndex, DropTable, DropView, IndexColumn,
    IndexColumnEntry, Insert, RawSql, RenameColumn, RenameTable, TagDatabase, ValueEntry,
};
pub use parser::ChangeLogParser;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::filter::Expression;

/// Identity of a changeset. Unique within a changelog and immutable once recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeSetId {
    pub id: String,
    pub author: String,
    pub file_path: String,
}

impl ChangeSetId {
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        file_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            file_path: file_path.into(),
        }
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.file_path, self.id, self.author)
    }
}

/// When a changeset is eligible to run again after its first execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Runs once. Changing it afterwards is a checksum error.
    #[default]
    Once,
    /// Runs on every update.
    Always,
    /// Runs again whenever its checksum changes.
    OnChange,
}

/// What to do when a changeset's preconditions do not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OnFail {
    /// Abort the run.
    #[default]
    Halt,
    /// Skip the changeset this run without recording it.
    Continue,
    /// Record the changeset as run without executing it.
    MarkRan,
    /// Log a warning and execute the changeset anyway.
    Warn,
}

/// Preconditions attached to a changeset. All conditions must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Preconditions {
    #[serde(default)]
    pub on_fail: OnFail,
    pub conditions: Vec<Precondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Precondition {
    #[serde(rename_all = "camelCase")]
    TableExists {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ColumnExists {
        #[serde(default)]
        schema_name: Option<String>,
        table_name: String,
        column_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ViewExists {
        #[serde(default)]
        schema_name: Option<String>,
        view_name: String,
    },
    #[serde(rename_all = "camelCase")]
    IndexExists {
        #[serde(default)]
        schema_name: Option<String>,
        index_name: String,
    },
    /// Holds when the single value returned by `sql` renders as `expected_result`.
    #[serde(rename_all = "camelCase")]
    SqlCheck { expected_result: String, sql: String },
    /// Holds when none of the nested conditions hold.
    Not(Vec<Precondition>),
}

/// Checksum accepted in place of any recorded value.
pub const ANY_CHECKSUM: &str = "ANY";

/// An atomic, uniquely-identified unit of change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub id: String,
    pub author: String,
    pub file_path: String,
    pub run_mode: RunMode,
    /// Raw context expression as written, kept for the history table.
    pub context: Option<String>,
    pub(crate) context_expression: Option<Expression>,
    pub labels: BTreeSet<String>,
    pub comment: Option<String>,
    pub changes: Vec<Change>,
    /// Explicit rollback. `Some(vec![])` declares that rolling back needs no statements.
    pub rollback: Option<Vec<Change>>,
    pub valid_checksums: Vec<String>,
    pub preconditions: Option<Preconditions>,
    checksum: String,
}

impl ChangeSet {
    /// Build a changeset, computing its checksum from `changes`.
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        file_path: impl Into<String>,
        changes: Vec<Change>,
    ) -> Result<Self, Error> {
        let checksum = compute_checksum(&changes)?;
        Ok(Self {
            id: id.into(),
            author: author.into(),
            file_path: file_path.into(),
            run_mode: RunMode::Once,
            context: None,
            context_expression: None,
            labels: BTreeSet::new(),
            comment: None,
            changes,
            rollback: None,
            valid_checksums: Vec::new(),
            preconditions: None,
            checksum,
        })
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_context(mut self, context: &str) -> Result<Self, Error> {
        self.context_expression = Expression::parse(context)?;
        self.context = self.context_expression.as_ref().map(|_| context.trim().to_string());
        Ok(self)
    }

    pub fn with_labels(mut self, labels: &str) -> Self {
        self.labels = crate::filter::split_list(labels);
        self
    }

    pub fn with_rollback(mut self, rollback: Vec<Change>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn identity(&self) -> ChangeSetId {
        ChangeSetId::new(&self.id, &self.author, &self.file_path)
    }

    /// SHA-256 over the normalized, parameter-substituted changes.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn context_expression(&self) -> Option<&Expression> {
        self.context_expression.as_ref()
    }

    /// Whether `recorded` is an acceptable checksum for this changeset.
    pub fn accepts_checksum(&self, recorded: &str) -> bool {
        recorded == self.checksum
            || self
                .valid_checksums
                .iter()
                .any(|c| c == recorded || c.eq_ignore_ascii_case(ANY_CHECKSUM))
    }

    /// The tag declared by a `tagDatabase` change in this changeset, if any.
    pub fn tag(&self) -> Option<&str> {
        self.changes.iter().find_map(|c| c.tag())
    }

    /// Summary of all changes, for the history table.
    pub fn description(&self) -> String {
        self.changes
            .iter()
            .map(|c| c.description())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Ordered, flattened sequence of changesets.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeLog {
    pub path: String,
    change_sets: Vec<ChangeSet>,
}

impl ChangeLog {
    /// Build a changelog, rejecting duplicate identities.
    pub fn new(path: impl Into<String>, change_sets: Vec<ChangeSet>) -> Result<Self, Error> {
        let mut seen = std::collections::HashSet::new();
        for change_set in &change_sets {
            let identity = change_set.identity();
            if !seen.insert(identity.clone()) {
                return Err(Error::DuplicateChangeSet(identity.to_string()));
            }
        }
        Ok(Self {
            path: path.into(),
            change_sets,
        })
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn find(&self, identity: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets
            .iter()
            .find(|cs| cs.id == identity.id && cs.author == identity.author && cs.file_path == identity.file_path)
    }

    /// Index of the changeset carrying `tagDatabase` for `tag`.
    pub fn tag_position(&self, tag: &str) -> Option<usize> {
        self.change_sets.iter().position(|cs| cs.tag() == Some(tag))
    }
}

/// Fields holding SQL text, where whitespace layout is not significant.
const SQL_TEXT_FIELDS: &[&str] = &["sql", "selectQuery", "where", "defaultValueComputed"];

/// Checksum of a change list. Whitespace runs in SQL text fields are collapsed first,
/// outside quoted literals, so reformatting SQL does not count as a modification.
/// Identifiers and values are hashed as written.
pub(crate) fn compute_checksum(changes: &[Change]) -> Result<String, Error> {
    let mut value = serde_json::to_value(changes)
        .map_err(|e| Error::Generic(format!("failed to serialize changes: {}", e)))?;
    normalize_sql_fields(&mut value);
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn normalize_sql_fields(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Array(items) => items.iter_mut().for_each(normalize_sql_fields),
        serde_json::Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                match field {
                    serde_json::Value::String(s) if SQL_TEXT_FIELDS.contains(&key.as_str()) => {
                        *s = normalize_sql_whitespace(s);
                    }
                    _ => normalize_sql_fields(field),
                }
            }
        }
        _ => {}
    }
}

/// Collapses whitespace runs to one space and trims the ends. Text inside `'...'` and
/// `"..."` is kept verbatim; a doubled quote closes and reopens the literal.
fn normalize_sql_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for ch in sql.chars() {
        match quote {
            Some(q) => {
                out.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch.is_whitespace() => pending_space = !out.is_empty(),
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(text: &str) -> Change {
        Change::Sql(RawSql {
            sql: text.to_string(),
            comment: None,
        })
    }

    #[test]
    fn checksum_ignores_whitespace_layout() {
        let a = compute_checksum(&[sql("INSERT INTO t VALUES (1)")]).unwrap();
        let b = compute_checksum(&[sql("INSERT INTO t\n    VALUES (1)  ")]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn checksum_changes_with_effective_sql() {
        let a = compute_checksum(&[sql("INSERT INTO t VALUES (1)")]).unwrap();
        let b = compute_checksum(&[sql("INSERT INTO t VALUES (2)")]).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    fn insert(value: &str) -> Change {
        Change::Insert(Insert {
            schema_name: None,
            table_name: "t".to_string(),
            columns: vec![ValueEntry {
                column: ColumnValue {
                    name: "x".to_string(),
                    value: Some(value.to_string()),
                    value_numeric: None,
                    value_boolean: None,
                },
            }],
        })
    }

    #[test]
    fn checksum_keeps_whitespace_in_values() {
        let a = compute_checksum(&[insert("a  b")]).unwrap();
        let b = compute_checksum(&[insert("a b")]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_keeps_whitespace_in_sql_literals() {
        let a = compute_checksum(&[sql("UPDATE t SET x = 'a  b'")]).unwrap();
        let b = compute_checksum(&[sql("UPDATE t SET x = 'a b'")]).unwrap();
        assert_ne!(a, b);

        let c = compute_checksum(&[sql("UPDATE t\n   SET x = 'a  b'  ")]).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn sql_whitespace_outside_quotes_is_collapsed() {
        assert_eq!(
            normalize_sql_whitespace("  SELECT  'it''s  here',\t\"a  b\"\n"),
            "SELECT 'it''s  here', \"a  b\""
        );
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        let a = ChangeSet::new("1", "alice", "master.yaml", vec![]).unwrap();
        let b = ChangeSet::new("1", "alice", "master.yaml", vec![]).unwrap();
        let result = ChangeLog::new("master.yaml", vec![a, b]);
        assert!(matches!(
            result,
            Err(Error::DuplicateChangeSet(id)) if id == "master.yaml::1::alice"
        ));
    }

    #[test]
    fn same_id_in_different_files_is_distinct() {
        let a = ChangeSet::new("1", "alice", "a.yaml", vec![]).unwrap();
        let b = ChangeSet::new("1", "alice", "b.yaml", vec![]).unwrap();
        assert!(ChangeLog::new("master.yaml", vec![a, b]).is_ok());
    }

    #[test]
    fn valid_checksum_list_accepts_recorded_values() {
        let mut cs = ChangeSet::new("1", "alice", "a.yaml", vec![sql("SELECT 1")]).unwrap();
        assert!(!cs.accepts_checksum("old"));
        cs.valid_checksums = vec!["old".to_string()];
        assert!(cs.accepts_checksum("old"));
        cs.valid_checksums = vec!["any".to_string()];
        assert!(cs.accepts_checksum("whatever"));
    }
}
