//! Database capability surface: identifier quoting, schema support, SQL generation and
//! catalog introspection.

use rusqlite::{Connection, OptionalExtension};

use crate::changelog::{Change, ColumnDefinition};
use crate::error::Error;

/// Dialect-specific behavior consumed by the history store, lock manager, migrator and
/// rollback generator.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_schemas(&self) -> bool;

    fn supports_catalogs(&self) -> bool;

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Quote `name`, prefixed by `schema` when one is given.
    fn qualify(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(name)
            ),
            None => self.quote_identifier(name),
        }
    }

    /// SQL statements implementing `change`. Objects without an explicit schema are placed in
    /// `default_schema`.
    fn generate_sql(
        &self,
        change: &Change,
        default_schema: Option<&str>,
    ) -> Result<Vec<String>, Error>;

    fn table_exists(&self, conn: &Connection, schema: Option<&str>, table: &str)
        -> Result<bool, Error>;

    fn view_exists(&self, conn: &Connection, schema: Option<&str>, view: &str)
        -> Result<bool, Error>;

    fn index_exists(&self, conn: &Connection, schema: Option<&str>, index: &str)
        -> Result<bool, Error>;

    fn column_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<bool, Error>;

    /// Statements dropping every user object in `schema`, except tables named in `preserve`.
    fn drop_all_statements(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        preserve: &[&str],
    ) -> Result<Vec<String>, Error>;
}

/// The schema a change or precondition names, falling back to `default`.
pub(crate) fn schema_or<'a>(explicit: &'a Option<String>, default: Option<&'a str>) -> Option<&'a str> {
    explicit.as_deref().or(default)
}

/// SQLite. Attached databases act as schemas (`main`, `temp`, or any `ATTACH ... AS name`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn column_sql(&self, column: &ColumnDefinition, inline_primary_key: bool) -> String {
        let mut sql = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            column.data_type
        );
        if inline_primary_key && column.constraints.primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if !column.constraints.nullable {
            sql.push_str(" NOT NULL");
        }
        if column.constraints.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(computed) = &column.default_value_computed {
            sql.push_str(&format!(" DEFAULT ({})", computed));
        } else if let Some(value) = &column.default_value {
            sql.push_str(&format!(" DEFAULT {}", self.quote_literal(value)));
        }
        sql
    }

    fn master_table(&self, schema: Option<&str>) -> String {
        format!(
            "{}.sqlite_master",
            self.quote_identifier(schema.unwrap_or("main"))
        )
    }

    fn object_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        kind: &str,
        name: &str,
    ) -> Result<bool, Error> {
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE type = ?1 AND name = ?2",
                self.master_table(schema)
            ),
            [kind, name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_schemas(&self) -> bool {
        true
    }

    fn supports_catalogs(&self) -> bool {
        false
    }

    fn generate_sql(
        &self,
        change: &Change,
        default_schema: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        let statements = match change {
            Change::CreateTable(c) => {
                let primary_keys: Vec<&ColumnDefinition> = c
                    .columns
                    .iter()
                    .map(|e| &e.column)
                    .filter(|col| col.constraints.primary_key)
                    .collect();
                let inline = primary_keys.len() <= 1;
                let mut parts: Vec<String> = c
                    .columns
                    .iter()
                    .map(|e| self.column_sql(&e.column, inline))
                    .collect();
                if !inline {
                    parts.push(format!(
                        "PRIMARY KEY ({})",
                        primary_keys
                            .iter()
                            .map(|col| self.quote_identifier(&col.name))
                            .collect::<Vec<_>>()
                            .join(", ")
                    ));
                }
                vec![format!(
                    "CREATE TABLE {} ({})",
                    self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name),
                    parts.join(", ")
                )]
            }
            Change::DropTable(c) => vec![format!(
                "DROP TABLE {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name)
            )],
            Change::AddColumn(c) => c
                .columns
                .iter()
                .map(|e| {
                    format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name),
                        self.column_sql(&e.column, true)
                    )
                })
                .collect(),
            Change::DropColumn(c) => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name),
                self.quote_identifier(&c.column_name)
            )],
            // the new name of a renamed table cannot carry a schema in SQLite
            Change::RenameTable(c) => vec![format!(
                "ALTER TABLE {} RENAME TO {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.old_table_name),
                self.quote_identifier(&c.new_table_name)
            )],
            Change::RenameColumn(c) => vec![format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name),
                self.quote_identifier(&c.old_column_name),
                self.quote_identifier(&c.new_column_name)
            )],
            // SQLite puts the schema on the index name; the table must be unqualified
            Change::CreateIndex(c) => vec![format!(
                "CREATE {}INDEX {} ON {} ({})",
                if c.unique { "UNIQUE " } else { "" },
                self.qualify(schema_or(&c.schema_name, default_schema), &c.index_name),
                self.quote_identifier(&c.table_name),
                c.columns
                    .iter()
                    .map(|e| self.quote_identifier(&e.column.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            )],
            Change::DropIndex(c) => vec![format!(
                "DROP INDEX {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.index_name)
            )],
            Change::CreateView(c) => {
                let name = self.qualify(schema_or(&c.schema_name, default_schema), &c.view_name);
                let mut statements = Vec::new();
                if c.replace_if_exists {
                    statements.push(format!("DROP VIEW IF EXISTS {}", name));
                }
                statements.push(format!("CREATE VIEW {} AS {}", name, c.select_query));
                statements
            }
            Change::DropView(c) => vec![format!(
                "DROP VIEW {}",
                self.qualify(schema_or(&c.schema_name, default_schema), &c.view_name)
            )],
            Change::Insert(c) => {
                if c.columns.is_empty() {
                    return Err(Error::Generic(format!(
                        "insert into '{}' has no columns",
                        c.table_name
                    )));
                }
                let names = c
                    .columns
                    .iter()
                    .map(|e| self.quote_identifier(&e.column.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                let values = c
                    .columns
                    .iter()
                    .map(|e| {
                        let column = &e.column;
                        if let Some(value) = &column.value {
                            self.quote_literal(value)
                        } else if let Some(number) = &column.value_numeric {
                            number.to_string()
                        } else if let Some(flag) = column.value_boolean {
                            String::from(if flag { "1" } else { "0" })
                        } else {
                            "NULL".to_string()
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                vec![format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name),
                    names,
                    values
                )]
            }
            Change::Delete(c) => {
                let table = self.qualify(schema_or(&c.schema_name, default_schema), &c.table_name);
                match &c.where_clause {
                    Some(clause) => vec![format!("DELETE FROM {} WHERE {}", table, clause)],
                    None => vec![format!("DELETE FROM {}", table)],
                }
            }
            Change::Sql(c) => vec![c.sql.trim().trim_end_matches(';').to_string()],
            Change::TagDatabase(_) => vec![],
        };
        Ok(statements)
    }

    fn table_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        table: &str,
    ) -> Result<bool, Error> {
        self.object_exists(conn, schema, "table", table)
    }

    fn view_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        view: &str,
    ) -> Result<bool, Error> {
        self.object_exists(conn, schema, "view", view)
    }

    fn index_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        index: &str,
    ) -> Result<bool, Error> {
        self.object_exists(conn, schema, "index", index)
    }

    fn column_exists(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        table: &str,
        column: &str,
    ) -> Result<bool, Error> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM pragma_table_info(?1, ?2) WHERE name = ?3",
                [table, schema.unwrap_or("main"), column],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn drop_all_statements(
        &self,
        conn: &Connection,
        schema: Option<&str>,
        preserve: &[&str],
    ) -> Result<Vec<String>, Error> {
        let mut stmt = conn.prepare(&format!(
            "SELECT type, name FROM {} \
             WHERE type IN ('view', 'trigger', 'table') AND name NOT LIKE 'sqlite_%' \
             ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END, name",
            self.master_table(schema)
        ))?;
        let objects = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        // indexes go away with their tables
        Ok(objects
            .into_iter()
            .filter(|(_, name)| !preserve.contains(&name.as_str()))
            .map(|(kind, name)| {
                format!(
                    "DROP {} IF EXISTS {}",
                    kind.to_uppercase(),
                    self.qualify(schema, &name)
                )
            })
            .collect())
    }
}
