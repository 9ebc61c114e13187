//! Runs configured migration targets when an application starts.
//!
//! Each target pairs a [MigrationConfig] with a [ConnectionProvider]. Synchronous targets run
//! on the calling thread from [StartupListener::on_startup]; targets marked `async` run on a
//! background thread started by [StartupListener::on_startup_async]. A failing target is
//! logged and never stops the others.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rusqlite::Connection;

use crate::config::{MigrationConfig, MigrationConfigs};
use crate::error::Error;
use crate::migrator::UpdateReport;
use crate::resource::ResourceAccessor;

/// Opens connections to a target database.
pub trait ConnectionProvider: Send + Sync {
    fn connection(&self) -> Result<Connection, Error>;
}

impl<F> ConnectionProvider for F
where
    F: Fn() -> Result<Connection, Error> + Send + Sync,
{
    fn connection(&self) -> Result<Connection, Error> {
        self()
    }
}

/// Opens a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnectionProvider {
    path: PathBuf,
}

impl SqliteConnectionProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConnectionProvider for SqliteConnectionProvider {
    fn connection(&self) -> Result<Connection, Error> {
        Connection::open(&self.path)
            .map_err(|e| Error::Connection(format!("{}: {}", self.path.display(), e)))
    }
}

/// Result of running one target.
#[derive(Debug)]
pub struct TargetOutcome {
    pub name: String,
    pub result: Result<UpdateReport, Error>,
}

pub struct StartupListener {
    accessor: Arc<dyn ResourceAccessor>,
    targets: Vec<MigrationConfig>,
    providers: HashMap<String, Arc<dyn ConnectionProvider>>,
}

impl std::fmt::Debug for StartupListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupListener")
            .field("targets", &self.targets)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StartupListener {
    pub fn new(accessor: Arc<dyn ResourceAccessor>) -> Self {
        Self {
            accessor,
            targets: Vec::new(),
            providers: HashMap::new(),
        }
    }

    /// Add every target in `configs`. Each still needs a provider registered under its name.
    pub fn with_configs(mut self, configs: MigrationConfigs) -> Self {
        self.targets.extend(configs.targets);
        self
    }

    /// Add a target together with its connection provider.
    pub fn with_target(
        mut self,
        config: MigrationConfig,
        provider: impl ConnectionProvider + 'static,
    ) -> Self {
        self.providers
            .insert(config.name.clone(), Arc::new(provider));
        self.targets.push(config);
        self
    }

    /// Register the provider for the target called `name`.
    pub fn with_provider(
        mut self,
        name: impl Into<String>,
        provider: impl ConnectionProvider + 'static,
    ) -> Self {
        self.providers.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn targets(&self) -> &[MigrationConfig] {
        &self.targets
    }

    /// Run the synchronous targets on the calling thread.
    pub fn on_startup(&self) -> Vec<TargetOutcome> {
        tracing::trace!("Executing synchronous migrations");
        self.run(false)
    }

    /// Run the async targets on a background thread.
    pub fn on_startup_async(self: &Arc<Self>) -> JoinHandle<Vec<TargetOutcome>> {
        let listener = Arc::clone(self);
        thread::spawn(move || {
            tracing::trace!("Executing asynchronous migrations");
            listener.run(true)
        })
    }

    /// Run every enabled target whose `async` flag equals `is_async`, in declaration order.
    pub fn run(&self, is_async: bool) -> Vec<TargetOutcome> {
        self.targets
            .iter()
            .filter(|config| config.enabled)
            .filter(|config| config.is_async == is_async)
            .filter_map(|config| match self.providers.get(&config.name) {
                Some(provider) => Some((config, provider)),
                None => {
                    tracing::warn!(
                        target_name = %config.name,
                        "No connection provider registered, skipping migration target"
                    );
                    None
                }
            })
            .map(|(config, provider)| {
                let result = self.run_target(config, provider.as_ref());
                if let Err(ref e) = result {
                    tracing::error!(target_name = %config.name, error = %e, "Migration target failed");
                }
                TargetOutcome {
                    name: config.name.clone(),
                    result,
                }
            })
            .collect()
    }

    /// Open a connection, parse the target's changelog and update. The connection is closed
    /// on return.
    pub fn run_target(
        &self,
        config: &MigrationConfig,
        provider: &dyn ConnectionProvider,
    ) -> Result<UpdateReport, Error> {
        let _span = tracing::info_span!("migration_target", target_name = %config.name).entered();
        let mut conn = provider.connection()?;
        let changelog = config
            .parser(self.accessor.as_ref())
            .parse(&config.change_log)?;
        let migrator = config.migrator();
        let ctx = config.run_context()?;
        if config.test_rollback_on_update {
            migrator.update_testing_rollback(&mut conn, &changelog, &ctx)
        } else {
            migrator.update(&mut conn, &changelog, &ctx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MemoryResourceAccessor;

    const CHANGELOG: &str = r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - createTable:
            tableName: ${table}
            columns:
              - column: { name: id, type: INTEGER }
"#;

    fn accessor() -> Arc<dyn ResourceAccessor> {
        Arc::new(
            MemoryResourceAccessor::new()
                .with("db/master.yaml", CHANGELOG)
                .with("db/broken.yaml", "databaseChangeLog: [ {"),
        )
    }

    fn config(name: &str, change_log: &str) -> MigrationConfig {
        let mut config = MigrationConfig::new(name, change_log);
        config
            .parameters
            .insert("table".to_string(), format!("{}_items", name));
        config
    }

    fn table_exists(path: &std::path::Path, table: &str) -> bool {
        let conn = Connection::open(path).unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn failing_target_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.db");
        let listener = StartupListener::new(accessor())
            .with_target(
                config("broken", "classpath:db/broken.yaml"),
                SqliteConnectionProvider::new(dir.path().join("broken.db")),
            )
            .with_target(
                config("unreachable", "db/master.yaml"),
                || -> Result<Connection, Error> { Err(Error::Connection("refused".to_string())) },
            )
            .with_target(
                config("good", "classpath:db/master.yaml"),
                SqliteConnectionProvider::new(&good),
            );

        let outcomes = listener.on_startup();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0].result, Err(Error::Parse { .. })));
        assert!(matches!(outcomes[1].result, Err(Error::Connection(_))));
        let report = outcomes[2].result.as_ref().unwrap();
        assert_eq!(report.change_sets_run.len(), 1);
        assert_eq!(report.change_sets_run[0].file_path, "db/master.yaml");
        assert!(table_exists(&good, "good_items"));
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failures_are_logged_with_target_name() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let listener = StartupListener::new(accessor()).with_target(
            config("reporting", "db/master.yaml"),
            || -> Result<Connection, Error> { Err(Error::Connection("refused".to_string())) },
        );
        let outcomes = tracing::subscriber::with_default(subscriber, || listener.on_startup());
        assert!(outcomes[0].result.is_err());

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Migration target failed"), "{}", output);
        assert!(output.contains("target_name=reporting"), "{}", output);
    }

    #[test]
    fn filters_by_enabled_and_async() {
        let dir = tempfile::tempdir().unwrap();
        let mut disabled = config("disabled", "db/master.yaml");
        disabled.enabled = false;
        let mut background = config("background", "db/master.yaml");
        background.is_async = true;

        let listener = Arc::new(
            StartupListener::new(accessor())
                .with_target(disabled, SqliteConnectionProvider::new(dir.path().join("a.db")))
                .with_target(background, SqliteConnectionProvider::new(dir.path().join("b.db")))
                .with_target(
                    config("foreground", "db/master.yaml"),
                    SqliteConnectionProvider::new(dir.path().join("c.db")),
                ),
        );

        let sync: Vec<String> = listener.on_startup().into_iter().map(|o| o.name).collect();
        assert_eq!(sync, vec!["foreground"]);

        let outcomes = listener.on_startup_async().join().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].name, "background");
        assert!(outcomes[0].result.is_ok());
        assert!(table_exists(&dir.path().join("b.db"), "background_items"));
        assert!(!dir.path().join("a.db").exists());
    }

    #[test]
    fn targets_without_provider_are_skipped() {
        let configs = MigrationConfigs {
            targets: vec![config("orphan", "db/master.yaml")],
        };
        let listener = StartupListener::new(accessor()).with_configs(configs);
        assert!(listener.on_startup().is_empty());
    }

    #[test]
    fn test_rollback_on_update_ends_updated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let mut target = config("checked", "db/master.yaml");
        target.test_rollback_on_update = true;
        let listener = StartupListener::new(accessor())
            .with_target(target, SqliteConnectionProvider::new(&path));
        let outcomes = listener.on_startup();
        assert!(outcomes[0].result.is_ok());
        assert!(table_exists(&path, "checked_items"));
    }
}
