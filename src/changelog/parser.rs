use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use super::{compute_checksum, Change, ChangeLog, ChangeSet, ChangeSetId, Preconditions, RunMode};
use crate::error::Error;
use crate::filter::{split_list, Expression};
use crate::resource::{strip_classpath_prefix, ResourceAccessor};

const ROOT_KEY: &str = "databaseChangeLog";

/// Parses changelog documents (YAML or JSON) into a flattened [ChangeLog].
///
/// Includes are expanded in place, `${name}` property tokens are substituted before checksums
/// are computed, and an include that re-enters a file still being parsed is reported as
/// [Error::CyclicInclude].
///
/// # Example
/// ```
/// use revisio::changelog::ChangeLogParser;
/// use revisio::resource::MemoryResourceAccessor;
///
/// let accessor = MemoryResourceAccessor::new().with(
///     "db/master.yaml",
///     r#"
/// databaseChangeLog:
///   - property: { name: prefix, value: app_ }
///   - changeSet:
///       id: "1"
///       author: alice
///       changes:
///         - sql: { sql: "CREATE TABLE ${prefix}users (id INTEGER)" }
/// "#,
/// );
/// let changelog = ChangeLogParser::new(&accessor).parse("db/master.yaml").unwrap();
/// assert_eq!(changelog.change_sets().len(), 1);
/// ```
pub struct ChangeLogParser<'a> {
    accessor: &'a dyn ResourceAccessor,
    parameters: BTreeMap<String, String>,
    ignore_classpath_prefix: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
enum Entry {
    Property(Property),
    Include(Include),
    ChangeSet(RawChangeSet),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Property {
    name: String,
    #[serde(deserialize_with = "scalar_string")]
    value: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Include {
    file: String,
    #[serde(default)]
    relative_to_changelog_file: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawChangeSet {
    #[serde(deserialize_with = "scalar_string")]
    id: String,
    author: String,
    #[serde(default)]
    run_always: bool,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default, alias = "contextFilter")]
    context: Option<String>,
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    valid_check_sum: Vec<String>,
    #[serde(default, rename = "preConditions")]
    preconditions: Option<Preconditions>,
    #[serde(default)]
    changes: Vec<Change>,
    #[serde(default)]
    rollback: Option<RawRollback>,
}

/// `rollback:` accepts either a bare SQL string or a list of changes.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRollback {
    Sql(String),
    Changes(Vec<Change>),
}

/// Ids are often written as bare numbers in YAML.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string, found {}",
            other
        ))),
    }
}

struct ParseState {
    open: Vec<String>,
    properties: BTreeMap<String, String>,
    change_sets: Vec<ChangeSet>,
    seen: HashSet<ChangeSetId>,
}

impl<'a> ChangeLogParser<'a> {
    pub fn new(accessor: &'a dyn ResourceAccessor) -> Self {
        Self {
            accessor,
            parameters: BTreeMap::new(),
            ignore_classpath_prefix: true,
        }
    }

    /// Externally supplied parameters. These take precedence over properties declared in the changelog.
    pub fn with_parameters<I, K, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.parameters
            .extend(parameters.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Whether a leading `classpath:` is dropped from the paths recorded in changeset identities.
    /// Defaults to `true`.
    pub fn ignore_classpath_prefix(mut self, ignore: bool) -> Self {
        self.ignore_classpath_prefix = ignore;
        self
    }

    pub fn parse(&self, path: &str) -> Result<ChangeLog, Error> {
        let root = self.logical_path(path);
        let mut state = ParseState {
            open: Vec::new(),
            properties: self.parameters.clone(),
            change_sets: Vec::new(),
            seen: HashSet::new(),
        };
        self.parse_file(&root, &mut state)?;

        tracing::debug!(
            changelog = %root,
            change_sets = state.change_sets.len(),
            "Parsed changelog"
        );

        ChangeLog::new(root, state.change_sets)
    }

    fn logical_path(&self, path: &str) -> String {
        if self.ignore_classpath_prefix {
            strip_classpath_prefix(path).to_string()
        } else {
            path.to_string()
        }
    }

    fn parse_file(&self, path: &str, state: &mut ParseState) -> Result<(), Error> {
        if state.open.iter().any(|p| p == path) {
            let mut chain = state.open.clone();
            chain.push(path.to_string());
            return Err(Error::CyclicInclude { chain });
        }
        state.open.push(path.to_string());

        let text = self.accessor.read(path)?;
        let document = load_document(path, &text)?;
        let entries = match document.get(ROOT_KEY) {
            Some(Value::Array(entries)) => entries,
            Some(Value::Null) => {
                state.open.pop();
                return Ok(());
            }
            _ => {
                return Err(Error::parse(
                    path,
                    format!("expected a top-level '{}' list", ROOT_KEY),
                ))
            }
        };

        for (index, raw) in entries.iter().enumerate() {
            let substituted = substitute_value(raw, &state.properties);
            let entry: Entry = serde_json::from_value(substituted)
                .map_err(|e| Error::parse(path, format!("entry {}: {}", index + 1, e)))?;
            match entry {
                Entry::Property(property) => {
                    // first definition wins, so configured parameters override the changelog
                    state
                        .properties
                        .entry(property.name)
                        .or_insert(property.value);
                }
                Entry::Include(include) => {
                    let target = if include.relative_to_changelog_file {
                        self.accessor.resolve(path, &include.file)
                    } else {
                        include.file
                    };
                    self.parse_file(&self.logical_path(&target), state)?;
                }
                Entry::ChangeSet(raw) => {
                    let change_set = build_change_set(path, raw)?;
                    let identity = change_set.identity();
                    if !state.seen.insert(identity.clone()) {
                        return Err(Error::DuplicateChangeSet(identity.to_string()));
                    }
                    state.change_sets.push(change_set);
                }
            }
        }

        state.open.pop();
        Ok(())
    }
}

fn load_document(path: &str, text: &str) -> Result<Value, Error> {
    let extension = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    match extension.as_str() {
        "json" => serde_json::from_str(text).map_err(|e| Error::parse(path, e)),
        "yaml" | "yml" => serde_yaml::from_str(text).map_err(|e| Error::parse(path, e)),
        other => Err(Error::parse(
            path,
            format!("unsupported changelog format '{}'", other),
        )),
    }
}

fn build_change_set(path: &str, raw: RawChangeSet) -> Result<ChangeSet, Error> {
    let run_mode = if raw.run_always {
        RunMode::Always
    } else if raw.run_on_change {
        RunMode::OnChange
    } else {
        RunMode::Once
    };
    let context_expression = match raw.context.as_deref() {
        Some(context) => Expression::parse(context)?,
        None => None,
    };
    let rollback = raw.rollback.map(|r| match r {
        RawRollback::Sql(sql) => vec![Change::Sql(super::RawSql { sql, comment: None })],
        RawRollback::Changes(changes) => changes,
    });
    let checksum = compute_checksum(&raw.changes)?;
    Ok(ChangeSet {
        id: raw.id,
        author: raw.author,
        file_path: path.to_string(),
        run_mode,
        context: context_expression
            .as_ref()
            .and(raw.context.map(|c| c.trim().to_string())),
        context_expression,
        labels: raw.labels.as_deref().map(split_list).unwrap_or_default(),
        comment: raw.comment,
        changes: raw.changes,
        rollback,
        valid_checksums: raw.valid_check_sum,
        preconditions: raw.preconditions,
        checksum,
    })
}

fn substitute_value(value: &Value, properties: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s, properties)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_value(v, properties))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, properties)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace `${name}` tokens with their property value. Unknown tokens are kept verbatim.
fn substitute(text: &str, properties: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match properties.get(name.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
