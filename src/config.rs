//! Migration target configuration.
//!
//! A configuration file holds one or more targets, each naming a changelog and the options a
//! run against that target uses:
//!
//! ```yaml
//! targets:
//!   - name: primary
//!     change-log: classpath:db/changelog/master.yaml
//!     contexts: prod
//!     parameters:
//!       prefix: app_
//!     lock:
//!       timeout-ms: 60000
//!   - name: reporting
//!     change-log: db/reporting.yaml
//!     async: true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::changelog::ChangeLogParser;
use crate::error::Error;
use crate::lock::LockSettings;
use crate::migrator::{Migrator, RunContext};
use crate::resource::ResourceAccessor;
use crate::rollback::encoding_for_label;

fn default_true() -> bool {
    true
}

fn default_output_encoding() -> String {
    "UTF-8".to_string()
}

/// One migration target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MigrationConfig {
    pub name: String,
    pub change_log: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Run on the background startup thread instead of blocking startup.
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub contexts: Option<String>,
    #[serde(default)]
    pub labels: Option<String>,
    /// Substituted for `${name}` tokens. Wins over properties declared in the changelog.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub drop_first: bool,
    #[serde(default)]
    pub default_schema: Option<String>,
    #[serde(default)]
    pub history_schema: Option<String>,
    #[serde(default)]
    pub history_table: Option<String>,
    #[serde(default)]
    pub lock_table: Option<String>,
    #[serde(default)]
    pub rollback_file: Option<PathBuf>,
    #[serde(default = "default_output_encoding")]
    pub output_encoding: String,
    #[serde(default = "default_true")]
    pub ignore_classpath_prefix: bool,
    #[serde(default)]
    pub test_rollback_on_update: bool,
    #[serde(default)]
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LockConfig {
    #[serde(default = "LockConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "LockConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Reclaim locks older than this. Unset never reclaims.
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

impl LockConfig {
    fn default_timeout_ms() -> u64 {
        300_000
    }

    fn default_poll_interval_ms() -> u64 {
        1_000
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            stale_after_ms: None,
        }
    }
}

impl From<LockConfig> for LockSettings {
    fn from(config: LockConfig) -> Self {
        LockSettings {
            timeout: Duration::from_millis(config.timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            stale_after: config.stale_after_ms.map(Duration::from_millis),
        }
    }
}

/// Blank strings count as unset.
fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl MigrationConfig {
    pub fn new(name: impl Into<String>, change_log: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            change_log: change_log.into(),
            enabled: true,
            is_async: false,
            tag: None,
            contexts: None,
            labels: None,
            parameters: BTreeMap::new(),
            drop_first: false,
            default_schema: None,
            history_schema: None,
            history_table: None,
            lock_table: None,
            rollback_file: None,
            output_encoding: default_output_encoding(),
            ignore_classpath_prefix: true,
            test_rollback_on_update: false,
            lock: LockConfig::default(),
        }
    }

    /// A [Migrator] with this target's schemas, table names and lock settings.
    pub fn migrator(&self) -> Migrator {
        let mut migrator = Migrator::new().with_lock_settings(self.lock.into());
        let dialect = migrator.dialect();
        let schemas_supported = dialect.supports_schemas() || dialect.supports_catalogs();
        for schema in [&self.default_schema, &self.history_schema] {
            if let Some(schema) = non_blank(schema).filter(|_| !schemas_supported) {
                tracing::warn!(
                    target_name = %self.name,
                    schema,
                    dialect = dialect.name(),
                    "Database supports neither schemas nor catalogs, ignoring configured schema"
                );
            }
        }
        if schemas_supported {
            if let Some(schema) = non_blank(&self.default_schema) {
                migrator = migrator.with_default_schema(schema);
            }
            if let Some(schema) = non_blank(&self.history_schema) {
                migrator = migrator.with_history_schema(schema);
            }
        }
        if let Some(table) = non_blank(&self.history_table) {
            migrator = migrator.with_history_table(table);
        }
        if let Some(table) = non_blank(&self.lock_table) {
            migrator = migrator.with_lock_table(table);
        }
        migrator
    }

    pub fn run_context(&self) -> Result<RunContext, Error> {
        let mut ctx = RunContext::default()
            .with_drop_first(self.drop_first)
            .with_output_encoding(encoding_for_label(&self.output_encoding)?);
        if let Some(contexts) = non_blank(&self.contexts) {
            ctx = ctx.with_contexts(contexts);
        }
        if let Some(labels) = non_blank(&self.labels) {
            ctx = ctx.with_labels(labels)?;
        }
        if let Some(tag) = non_blank(&self.tag) {
            ctx = ctx.with_tag(tag);
        }
        if let Some(path) = &self.rollback_file {
            ctx = ctx.with_rollback_file(path);
        }
        Ok(ctx)
    }

    pub fn parser<'a>(&self, accessor: &'a dyn ResourceAccessor) -> ChangeLogParser<'a> {
        ChangeLogParser::new(accessor)
            .with_parameters(self.parameters.clone())
            .ignore_classpath_prefix(self.ignore_classpath_prefix)
    }

    fn check(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("target name must not be empty".to_string()));
        }
        if self.change_log.trim().is_empty() {
            return Err(Error::Config(format!(
                "target '{}' has no change-log",
                self.name
            )));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(Error::Config(format!(
                "target '{}' has a zero lock poll interval",
                self.name
            )));
        }
        encoding_for_label(&self.output_encoding)?;
        Ok(())
    }
}

/// Every configured target, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfigs {
    #[serde(default)]
    pub targets: Vec<MigrationConfig>,
}

impl MigrationConfigs {
    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Err(Error::Config(format!(
                "unsupported configuration file '{}', expected .json, .yaml or .yml",
                path.display()
            ))),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, Error> {
        let configs: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        configs.check()?;
        Ok(configs)
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let configs: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        configs.check()?;
        Ok(configs)
    }

    fn check(&self) -> Result<(), Error> {
        let mut names = std::collections::HashSet::new();
        for target in &self.targets {
            target.check()?;
            if !names.insert(target.name.as_str()) {
                return Err(Error::Config(format!(
                    "target '{}' is configured more than once",
                    target.name
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MigrationConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_minimal_target() {
        let configs = MigrationConfigs::from_yaml_str(
            "targets:\n  - name: primary\n    change-log: db/master.yaml\n",
        )
        .unwrap();
        let target = &configs.targets[0];
        assert_eq!(target, &MigrationConfig::new("primary", "db/master.yaml"));
        assert!(target.enabled);
        assert!(!target.is_async);
        assert!(target.ignore_classpath_prefix);
        assert_eq!(target.output_encoding, "UTF-8");
        assert_eq!(LockSettings::from(target.lock), LockSettings::default());
    }

    #[test]
    fn full_target_from_json() {
        let configs = MigrationConfigs::from_json_str(
            r#"{"targets": [{
                "name": "reporting",
                "change-log": "classpath:db/reporting.yaml",
                "async": true,
                "contexts": "prod",
                "labels": "v1 and !experimental",
                "tag": "  ",
                "parameters": {"prefix": "rpt_"},
                "history-table": "history",
                "lock": {"timeout-ms": 500, "poll-interval-ms": 50, "stale-after-ms": 60000}
            }]}"#,
        )
        .unwrap();
        let target = configs.get("reporting").unwrap();
        assert!(target.is_async);
        assert_eq!(target.parameters["prefix"], "rpt_");

        let settings = LockSettings::from(target.lock);
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.stale_after, Some(Duration::from_secs(60)));

        let ctx = target.run_context().unwrap();
        // a blank tag means no tag
        assert_eq!(ctx.tag, None);
        assert!(!ctx.contexts.is_empty());
        assert_eq!(ctx.labels.to_string(), "v1 and !experimental");
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            MigrationConfigs::from_yaml_str("targets:\n  - name: a\n    change-log: x.yaml\n    bogus: 1\n"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MigrationConfigs::from_yaml_str(
                "targets:\n  - name: a\n    change-log: x.yaml\n  - name: a\n    change-log: y.yaml\n"
            ),
            Err(Error::Config(message)) if message.contains("more than once")
        ));
        assert!(matches!(
            MigrationConfigs::from_yaml_str(
                "targets:\n  - name: a\n    change-log: x.yaml\n    output-encoding: nope\n"
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn loads_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("revisio.yml");
        std::fs::write(&path, "targets:\n  - name: a\n    change-log: x.yaml\n").unwrap();
        assert_eq!(MigrationConfigs::from_path(&path).unwrap().targets.len(), 1);

        let toml = dir.path().join("revisio.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            MigrationConfigs::from_path(&toml),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            MigrationConfigs::from_path(dir.path().join("missing.yaml")),
            Err(Error::Io { .. })
        ));
    }
}
