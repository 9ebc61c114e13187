//! Change operations that make up a changeset.
//!
//! Each variant is deserialized from a single-key map in the changelog document, for example
//! `- createTable: { tableName: users, columns: [...] }`. Field names follow the camelCase
//! spelling used in changelog files.

use serde::{Deserialize, Serialize};

/// A single schema or data change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Change {
    CreateTable(CreateTable),
    DropTable(DropTable),
    AddColumn(AddColumn),
    DropColumn(DropColumn),
    RenameTable(RenameTable),
    RenameColumn(RenameColumn),
    CreateIndex(CreateIndex),
    DropIndex(DropIndex),
    CreateView(CreateView),
    DropView(DropView),
    Insert(Insert),
    Delete(Delete),
    Sql(RawSql),
    TagDatabase(TagDatabase),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ColumnEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub old_table_name: String,
    pub new_table_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RenameColumn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub old_column_name: String,
    pub new_column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub index_name: String,
    pub table_name: String,
    pub columns: Vec<IndexColumnEntry>,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub index_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub view_name: String,
    pub select_query: String,
    #[serde(default)]
    pub replace_if_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DropView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub view_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Insert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    pub columns: Vec<ValueEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Delete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub table_name: String,
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<String>,
}

/// Free-form SQL, executed as a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSql {
    pub sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Marks the point in the changelog that a tag refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TagDatabase {
    pub tag: String,
}

/// Wrapper matching the `- column: {...}` list item shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnEntry {
    pub column: ColumnDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value_computed: Option<String>,
    #[serde(default)]
    pub constraints: ColumnConstraints,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnConstraints {
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
}

impl Default for ColumnConstraints {
    fn default() -> Self {
        Self {
            primary_key: false,
            nullable: true,
            unique: false,
        }
    }
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexColumnEntry {
    pub column: IndexColumn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexColumn {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueEntry {
    pub column: ColumnValue,
}

/// A column/value pair for `insert`. At most one of the value fields is expected; none means NULL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ColumnValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_numeric: Option<serde_json::Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_boolean: Option<bool>,
}

impl Change {
    /// The changelog keyword for this change, e.g. `createTable`.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::CreateTable(_) => "createTable",
            Change::DropTable(_) => "dropTable",
            Change::AddColumn(_) => "addColumn",
            Change::DropColumn(_) => "dropColumn",
            Change::RenameTable(_) => "renameTable",
            Change::RenameColumn(_) => "renameColumn",
            Change::CreateIndex(_) => "createIndex",
            Change::DropIndex(_) => "dropIndex",
            Change::CreateView(_) => "createView",
            Change::DropView(_) => "dropView",
            Change::Insert(_) => "insert",
            Change::Delete(_) => "delete",
            Change::Sql(_) => "sql",
            Change::TagDatabase(_) => "tagDatabase",
        }
    }

    /// Short human-readable summary, stored in the history table's description column.
    pub fn description(&self) -> String {
        match self {
            Change::CreateTable(c) => format!("createTable tableName={}", c.table_name),
            Change::DropTable(c) => format!("dropTable tableName={}", c.table_name),
            Change::AddColumn(c) => format!("addColumn tableName={}", c.table_name),
            Change::DropColumn(c) => format!(
                "dropColumn columnName={}, tableName={}",
                c.column_name, c.table_name
            ),
            Change::RenameTable(c) => format!(
                "renameTable newTableName={}, oldTableName={}",
                c.new_table_name, c.old_table_name
            ),
            Change::RenameColumn(c) => format!(
                "renameColumn newColumnName={}, oldColumnName={}, tableName={}",
                c.new_column_name, c.old_column_name, c.table_name
            ),
            Change::CreateIndex(c) => format!(
                "createIndex indexName={}, tableName={}",
                c.index_name, c.table_name
            ),
            Change::DropIndex(c) => format!("dropIndex indexName={}", c.index_name),
            Change::CreateView(c) => format!("createView viewName={}", c.view_name),
            Change::DropView(c) => format!("dropView viewName={}", c.view_name),
            Change::Insert(c) => format!("insert tableName={}", c.table_name),
            Change::Delete(c) => format!("delete tableName={}", c.table_name),
            Change::Sql(_) => "sql".to_string(),
            Change::TagDatabase(c) => format!("tagDatabase tag={}", c.tag),
        }
    }

    /// The tag set by this change, if it is a `tagDatabase`.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Change::TagDatabase(c) => Some(&c.tag),
            _ => None,
        }
    }

    /// Derive the changes that undo this one.
    ///
    /// Returns `None` when the inverse cannot be derived from the change alone
    /// (dropped objects, raw SQL, data changes).
    pub fn inverse(&self) -> Option<Vec<Change>> {
        match self {
            Change::CreateTable(c) => Some(vec![Change::DropTable(DropTable {
                schema_name: c.schema_name.clone(),
                table_name: c.table_name.clone(),
            })]),
            // columns are dropped last-added first
            Change::AddColumn(c) => Some(
                c.columns
                    .iter()
                    .rev()
                    .map(|entry| {
                        Change::DropColumn(DropColumn {
                            schema_name: c.schema_name.clone(),
                            table_name: c.table_name.clone(),
                            column_name: entry.column.name.clone(),
                        })
                    })
                    .collect(),
            ),
            Change::RenameTable(c) => Some(vec![Change::RenameTable(RenameTable {
                schema_name: c.schema_name.clone(),
                old_table_name: c.new_table_name.clone(),
                new_table_name: c.old_table_name.clone(),
            })]),
            Change::RenameColumn(c) => Some(vec![Change::RenameColumn(RenameColumn {
                schema_name: c.schema_name.clone(),
                table_name: c.table_name.clone(),
                old_column_name: c.new_column_name.clone(),
                new_column_name: c.old_column_name.clone(),
            })]),
            Change::CreateIndex(c) => Some(vec![Change::DropIndex(DropIndex {
                schema_name: c.schema_name.clone(),
                index_name: c.index_name.clone(),
                table_name: Some(c.table_name.clone()),
            })]),
            Change::CreateView(c) if !c.replace_if_exists => {
                Some(vec![Change::DropView(DropView {
                    schema_name: c.schema_name.clone(),
                    view_name: c.view_name.clone(),
                })])
            }
            Change::TagDatabase(_) => Some(vec![]),
            Change::CreateView(_)
            | Change::DropTable(_)
            | Change::DropColumn(_)
            | Change::DropIndex(_)
            | Change::DropView(_)
            | Change::Insert(_)
            | Change::Delete(_)
            | Change::Sql(_) => None,
        }
    }
}
