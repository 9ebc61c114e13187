//! Rollback derivation and rollback SQL output.

use std::io::Write;
use std::path::Path;

use encoding_rs::Encoding;

use crate::changelog::{Change, ChangeSet, ChangeSetId};
use crate::dialect::Dialect;
use crate::error::Error;
use crate::history::HistoryStore;

/// The changes that undo `change_set`: its explicit rollback when declared, otherwise the
/// inverse of each change in reverse order.
pub fn rollback_changes(change_set: &ChangeSet) -> Result<Vec<Change>, Error> {
    if let Some(explicit) = &change_set.rollback {
        return Ok(explicit.clone());
    }
    let mut changes = Vec::new();
    for change in change_set.changes.iter().rev() {
        match change.inverse() {
            Some(inverse) => changes.extend(inverse),
            None => {
                return Err(Error::NoRollbackAvailable {
                    changeset: change_set.identity().to_string(),
                    reason: format!(
                        "'{}' cannot be reversed automatically and no rollback is declared",
                        change.kind()
                    ),
                })
            }
        }
    }
    Ok(changes)
}

/// Statements rolling back one changeset, ending with the removal of its history rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackScript {
    pub change_set: ChangeSetId,
    pub statements: Vec<String>,
}

pub struct RollbackGenerator<'a> {
    dialect: &'a dyn Dialect,
    default_schema: Option<&'a str>,
    history: &'a HistoryStore<'a>,
}

impl<'a> RollbackGenerator<'a> {
    pub fn new(
        dialect: &'a dyn Dialect,
        default_schema: Option<&'a str>,
        history: &'a HistoryStore<'a>,
    ) -> Self {
        Self {
            dialect,
            default_schema,
            history,
        }
    }

    /// Scripts undoing `change_sets`, newest first. `change_sets` is given in application order.
    pub fn generate(&self, change_sets: &[&ChangeSet]) -> Result<Vec<RollbackScript>, Error> {
        change_sets
            .iter()
            .rev()
            .map(|change_set| self.script(change_set))
            .collect()
    }

    fn script(&self, change_set: &ChangeSet) -> Result<RollbackScript, Error> {
        let mut statements = Vec::new();
        for change in rollback_changes(change_set)? {
            statements.extend(self.dialect.generate_sql(&change, self.default_schema)?);
        }
        statements.push(self.history.remove_sql(&change_set.identity()));
        Ok(RollbackScript {
            change_set: change_set.identity(),
            statements,
        })
    }
}

/// Render scripts as a SQL file. The output carries no timestamps, so the same input always
/// yields the same bytes.
pub fn render(changelog_path: &str, scripts: &[RollbackScript]) -> String {
    let mut text = String::new();
    text.push_str("-- *********************************************************************\n");
    text.push_str(&format!("-- Rollback SQL for {}\n", changelog_path));
    text.push_str("-- *********************************************************************\n");
    for script in scripts {
        text.push_str(&format!("\n-- Rolling back changeset {}\n", script.change_set));
        for statement in &script.statements {
            text.push_str(statement);
            text.push_str(";\n");
        }
    }
    text
}

/// Write rendered scripts to `sink` in `encoding`.
///
/// Returns `true` when some characters had no mapping in `encoding` and were written as
/// numeric character references instead.
pub fn write<W: Write>(
    sink: &mut W,
    changelog_path: &str,
    scripts: &[RollbackScript],
    encoding: &'static Encoding,
) -> std::io::Result<bool> {
    let text = render(changelog_path, scripts);
    let (bytes, _, had_errors) = encoding.encode(&text);
    if had_errors {
        tracing::warn!(
            encoding = encoding.name(),
            "Rollback SQL contains characters the output encoding cannot represent"
        );
    }
    sink.write_all(&bytes)?;
    sink.flush()?;
    Ok(had_errors)
}

pub fn write_file(
    path: &Path,
    changelog_path: &str,
    scripts: &[RollbackScript],
    encoding: &'static Encoding,
) -> Result<(), Error> {
    let mut file = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
    write(&mut file, changelog_path, scripts, encoding).map_err(|e| Error::io(path, e))?;
    tracing::info!(path = %path.display(), changesets = scripts.len(), "Wrote rollback SQL");
    Ok(())
}

/// Look up an output encoding by its WHATWG label, e.g. `UTF-8` or `windows-1252`.
/// UTF-16 labels resolve but encode as UTF-8.
pub fn encoding_for_label(label: &str) -> Result<&'static Encoding, Error> {
    Encoding::for_label(label.trim().as_bytes())
        .map(|e| e.output_encoding())
        .ok_or_else(|| Error::Config(format!("unknown output encoding '{}'", label)))
}
