//! The executor: applies pending changesets under the migration lock.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use encoding_rs::{Encoding, UTF_8};
use rusqlite::types::Value;
use rusqlite::Connection;

use crate::changelog::{ChangeLog, ChangeSet, ChangeSetId, OnFail, Precondition};
use crate::dialect::{schema_or, Dialect, SqliteDialect};
use crate::error::Error;
use crate::filter::{Contexts, LabelExpression};
use crate::history::{
    self, latest_by_identity, ExecType, HistoryRecord, HistoryStore, DEFAULT_HISTORY_TABLE_NAME,
};
use crate::lock::{lock_owner, LockManager, LockRecord, LockSettings, DEFAULT_LOCK_TABLE_NAME};
use crate::rollback::{self, rollback_changes, RollbackGenerator};

/// Per-run options. Each run owns its context.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub contexts: Contexts,
    pub labels: LabelExpression,
    /// Stop after the changeset that tags the database with this name.
    pub tag: Option<String>,
    /// Drop every object in the default schema before updating. Destroys data.
    pub drop_first: bool,
    /// Write future-rollback SQL here before applying changes.
    pub rollback_file: Option<PathBuf>,
    pub output_encoding: &'static Encoding,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            contexts: Contexts::default(),
            labels: LabelExpression::default(),
            tag: None,
            drop_first: false,
            rollback_file: None,
            output_encoding: UTF_8,
        }
    }
}

impl RunContext {
    pub fn with_contexts(mut self, contexts: &str) -> Self {
        self.contexts = Contexts::parse(contexts);
        self
    }

    pub fn with_labels(mut self, labels: &str) -> Result<Self, Error> {
        self.labels = LabelExpression::parse(labels)?;
        Ok(self)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_drop_first(mut self, drop_first: bool) -> Self {
        self.drop_first = drop_first;
        self
    }

    pub fn with_rollback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rollback_file = Some(path.into());
        self
    }

    pub fn with_output_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.output_encoding = encoding;
        self
    }

    fn selects(&self, change_set: &ChangeSet) -> bool {
        self.contexts.allows(change_set.context_expression()) && self.labels.allows(&change_set.labels)
    }
}

/// What an update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub deployment_id: String,
    pub history_table_existed: bool,
    pub dropped_first: bool,
    pub change_sets_run: Vec<ChangeSetId>,
    pub change_sets_marked_ran: Vec<ChangeSetId>,
    /// Filtered out by contexts or labels, or skipped by a `CONTINUE` precondition.
    pub change_sets_skipped: Vec<ChangeSetId>,
    pub rollback_file: Option<PathBuf>,
    /// Set when the rollback preview could not be written. The update still ran.
    pub rollback_error: Option<String>,
}

/// Changesets a run would execute and those its filters excluded, both in changelog order.
#[derive(Debug)]
pub struct Plan<'c> {
    pub pending: Vec<&'c ChangeSet>,
    pub skipped: Vec<&'c ChangeSet>,
}

/// Applies changelogs to a database.
pub struct Migrator {
    dialect: Box<dyn Dialect>,
    default_schema: Option<String>,
    history_schema: Option<String>,
    history_table: String,
    lock_table: String,
    lock_settings: LockSettings,
    busy_timeout: Duration,
    applied_by: String,
    on_change_set_start: Option<Box<dyn Fn(&ChangeSetId) + Send + Sync>>,
    on_change_set_complete: Option<Box<dyn Fn(&ChangeSetId, Duration) + Send + Sync>>,
    on_change_set_skipped: Option<Box<dyn Fn(&ChangeSetId, &str) + Send + Sync>>,
    on_change_set_error: Option<Box<dyn Fn(&ChangeSetId, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("dialect", &self.dialect.name())
            .field("default_schema", &self.default_schema)
            .field("history_schema", &self.history_schema)
            .field("history_table", &self.history_table)
            .field("lock_table", &self.lock_table)
            .field("lock_settings", &self.lock_settings)
            .field("busy_timeout", &self.busy_timeout)
            .field("on_change_set_start", &self.on_change_set_start.is_some())
            .field("on_change_set_complete", &self.on_change_set_complete.is_some())
            .field("on_change_set_skipped", &self.on_change_set_skipped.is_some())
            .field("on_change_set_error", &self.on_change_set_error.is_some())
            .finish()
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            dialect: Box::new(SqliteDialect),
            default_schema: None,
            history_schema: None,
            history_table: DEFAULT_HISTORY_TABLE_NAME.to_string(),
            lock_table: DEFAULT_LOCK_TABLE_NAME.to_string(),
            lock_settings: LockSettings::default(),
            busy_timeout: Duration::from_secs(30),
            applied_by: lock_owner(),
            on_change_set_start: None,
            on_change_set_complete: None,
            on_change_set_skipped: None,
            on_change_set_error: None,
        }
    }

    pub fn with_dialect(mut self, dialect: Box<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    /// Schema for objects whose changes do not name one.
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }

    /// Schema holding the history and lock tables. Defaults to the default schema.
    pub fn with_history_schema(mut self, schema: impl Into<String>) -> Self {
        self.history_schema = Some(schema.into());
        self
    }

    /// Defaults to "_revisio_history_".
    pub fn with_history_table(mut self, name: impl Into<String>) -> Self {
        self.history_table = name.into();
        self
    }

    /// Defaults to "_revisio_lock_".
    pub fn with_lock_table(mut self, name: impl Into<String>) -> Self {
        self.lock_table = name.into();
        self
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = settings;
        self
    }

    /// How long a statement waits on a database-level lock held by another connection.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Name recorded as `applied_by` in history and as the lock holder.
    pub fn with_applied_by(mut self, applied_by: impl Into<String>) -> Self {
        self.applied_by = applied_by.into();
        self
    }

    /// Called before each changeset executes.
    pub fn on_change_set_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetId) + Send + Sync + 'static,
    {
        self.on_change_set_start = Some(Box::new(callback));
        self
    }

    /// Called after each changeset commits, with its execution time.
    pub fn on_change_set_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetId, Duration) + Send + Sync + 'static,
    {
        self.on_change_set_complete = Some(Box::new(callback));
        self
    }

    /// Called for changesets that are skipped, with the reason.
    pub fn on_change_set_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetId, &str) + Send + Sync + 'static,
    {
        self.on_change_set_skipped = Some(Box::new(callback));
        self
    }

    /// Called when a changeset fails.
    pub fn on_change_set_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ChangeSetId, &Error) + Send + Sync + 'static,
    {
        self.on_change_set_error = Some(Box::new(callback));
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn history_table(&self) -> &str {
        &self.history_table
    }

    pub fn lock_table(&self) -> &str {
        &self.lock_table
    }

    fn history_schema(&self) -> Option<&str> {
        self.history_schema
            .as_deref()
            .or(self.default_schema.as_deref())
    }

    fn history_store(&self) -> HistoryStore<'_> {
        HistoryStore::new(self.dialect.as_ref(), self.history_schema(), &self.history_table)
    }

    fn lock_manager(&self) -> LockManager<'_> {
        LockManager::new(
            self.dialect.as_ref(),
            self.history_schema(),
            &self.lock_table,
            self.lock_settings,
        )
        .with_owner(&self.applied_by)
    }

    /// Run `f` while holding the migration lock. The lock is released whatever `f` returns.
    fn with_lock<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let mut lock = self.lock_manager();
        lock.acquire(conn)?;
        let result = f(conn);
        match (result, lock.release(conn)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_error)) => Err(release_error),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                tracing::error!(
                    error = %release_error,
                    "Failed to release migration lock after a failed run"
                );
                Err(e)
            }
        }
    }

    /// Apply every pending changeset selected by `ctx`.
    pub fn update(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        ctx: &RunContext,
    ) -> Result<UpdateReport, Error> {
        let _span = tracing::info_span!("update", changelog = %changelog.path).entered();
        self.with_lock(conn, |conn| self.update_locked(conn, changelog, ctx))
    }

    fn update_locked(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        ctx: &RunContext,
    ) -> Result<UpdateReport, Error> {
        let mut report = UpdateReport {
            deployment_id: uuid::Uuid::new_v4().to_string(),
            history_table_existed: false,
            dropped_first: false,
            change_sets_run: Vec::new(),
            change_sets_marked_ran: Vec::new(),
            change_sets_skipped: Vec::new(),
            rollback_file: None,
            rollback_error: None,
        };

        if ctx.drop_first {
            self.drop_all_locked(conn)?;
            report.dropped_first = true;
        }

        let store = self.history_store();
        report.history_table_existed = store.ensure_table(conn)?;
        let records = store.records(conn)?;
        history::validate(changelog, &records)?;

        let plan = self.plan(changelog, &records, ctx)?;
        tracing::debug!(
            pending = ?plan.pending.iter().map(|cs| cs.identity().to_string()).collect::<Vec<_>>(),
            skipped = plan.skipped.len(),
            "Considering changesets to run"
        );
        for change_set in &plan.skipped {
            self.skip(change_set, "excluded by contexts or labels", &mut report);
        }

        if let Some(path) = &ctx.rollback_file {
            let written = RollbackGenerator::new(
                self.dialect.as_ref(),
                self.default_schema.as_deref(),
                &store,
            )
            .generate(&plan.pending)
            .and_then(|scripts| {
                rollback::write_file(path, &changelog.path, &scripts, ctx.output_encoding)
            });
            match written {
                Ok(()) => report.rollback_file = Some(path.clone()),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "Could not write rollback SQL, continuing with update"
                    );
                    report.rollback_error = Some(e.to_string());
                }
            }
        }

        let previously_recorded: HashSet<ChangeSetId> =
            records.iter().map(|r| r.identity()).collect();
        for change_set in plan.pending {
            let previously_ran = previously_recorded.contains(&change_set.identity());
            self.apply(conn, change_set, previously_ran, &mut report)?;
        }

        tracing::info!(
            run = report.change_sets_run.len(),
            marked_ran = report.change_sets_marked_ran.len(),
            skipped = report.change_sets_skipped.len(),
            "Update complete"
        );
        Ok(report)
    }

    /// Pending changesets split by the run's filters, cut at `ctx.tag`.
    pub fn plan<'c>(
        &self,
        changelog: &'c ChangeLog,
        history: &[HistoryRecord],
        ctx: &RunContext,
    ) -> Result<Plan<'c>, Error> {
        let cut = match &ctx.tag {
            Some(tag) => Some(
                changelog
                    .tag_position(tag)
                    .ok_or_else(|| Error::UnknownTag(tag.clone()))?,
            ),
            None => None,
        };
        let pending: HashSet<ChangeSetId> = history::pending_changesets(changelog, history)
            .iter()
            .map(|cs| cs.identity())
            .collect();
        let mut plan = Plan {
            pending: Vec::new(),
            skipped: Vec::new(),
        };
        for (position, change_set) in changelog.change_sets().iter().enumerate() {
            if cut.is_some_and(|cut| position > cut) {
                break;
            }
            if !pending.contains(&change_set.identity()) {
                continue;
            }
            if ctx.selects(change_set) {
                plan.pending.push(change_set);
            } else {
                plan.skipped.push(change_set);
            }
        }
        Ok(plan)
    }

    fn skip(&self, change_set: &ChangeSet, reason: &str, report: &mut UpdateReport) {
        let identity = change_set.identity();
        tracing::debug!(changeset = %identity, reason, "Skipping changeset");
        if let Some(ref callback) = self.on_change_set_skipped {
            callback(&identity, reason);
        }
        report.change_sets_skipped.push(identity);
    }

    fn apply(
        &self,
        conn: &mut Connection,
        change_set: &ChangeSet,
        previously_ran: bool,
        report: &mut UpdateReport,
    ) -> Result<(), Error> {
        let identity = change_set.identity();
        let _span = tracing::info_span!("change_set", id = %identity).entered();

        let fail = |error: Error| {
            tracing::error!(error = %error, "Changeset failed");
            if let Some(ref callback) = self.on_change_set_error {
                callback(&identity, &error);
            }
            error
        };

        let mut exec_type = if previously_ran {
            ExecType::Reran
        } else {
            ExecType::Executed
        };

        if let Some(preconditions) = &change_set.preconditions {
            let failure = self
                .failed_precondition(conn, &preconditions.conditions)
                .map_err(|e| execution_error(&identity, e))
                .map_err(fail)?;
            if let Some(message) = failure {
                match preconditions.on_fail {
                    OnFail::Halt => {
                        return Err(fail(Error::PreconditionFailed {
                            changeset: identity.to_string(),
                            message,
                        }))
                    }
                    OnFail::Continue => {
                        self.skip(change_set, &format!("precondition failed: {}", message), report);
                        return Ok(());
                    }
                    OnFail::MarkRan => {
                        tracing::info!(%message, "Precondition failed, marking changeset as ran");
                        exec_type = ExecType::MarkRan;
                    }
                    OnFail::Warn => {
                        tracing::warn!(%message, "Precondition failed, running changeset anyway");
                    }
                }
            }
        }

        tracing::info!("Starting changeset");
        if let Some(ref callback) = self.on_change_set_start {
            callback(&identity);
        }
        let started = Instant::now();

        self.execute_in_transaction(conn, change_set, exec_type, &report.deployment_id)
            .map_err(|e| execution_error(&identity, e))
            .map_err(fail)?;

        let duration = started.elapsed();
        tracing::info!(
            duration_ms = duration.as_millis(),
            exec_type = %exec_type,
            "Changeset completed successfully"
        );
        if let Some(ref callback) = self.on_change_set_complete {
            callback(&identity, duration);
        }
        match exec_type {
            ExecType::MarkRan => report.change_sets_marked_ran.push(identity),
            ExecType::Executed | ExecType::Reran => report.change_sets_run.push(identity),
        }
        Ok(())
    }

    /// Execute the changeset and record it in one transaction. Nothing is kept on failure.
    fn execute_in_transaction(
        &self,
        conn: &mut Connection,
        change_set: &ChangeSet,
        exec_type: ExecType,
        deployment_id: &str,
    ) -> Result<(), Error> {
        let tx = conn.transaction()?;
        if exec_type != ExecType::MarkRan {
            for change in &change_set.changes {
                for statement in self
                    .dialect
                    .generate_sql(change, self.default_schema.as_deref())?
                {
                    tracing::debug!(sql = %statement, "Executing");
                    tx.execute_batch(&statement)?;
                }
            }
        }
        self.history_store().record_applied(
            &tx,
            change_set,
            exec_type,
            deployment_id,
            &self.applied_by,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The first condition that does not hold, described. `None` when all hold.
    fn failed_precondition(
        &self,
        conn: &Connection,
        conditions: &[Precondition],
    ) -> Result<Option<String>, Error> {
        for condition in conditions {
            if !self.precondition_holds(conn, condition)? {
                return Ok(Some(describe_precondition(condition)));
            }
        }
        Ok(None)
    }

    fn precondition_holds(&self, conn: &Connection, condition: &Precondition) -> Result<bool, Error> {
        let default_schema = self.default_schema.as_deref();
        match condition {
            Precondition::TableExists {
                schema_name,
                table_name,
            } => self.dialect.table_exists(conn, schema_or(schema_name, default_schema), table_name),
            Precondition::ColumnExists {
                schema_name,
                table_name,
                column_name,
            } => self
                .dialect
                .column_exists(conn, schema_or(schema_name, default_schema), table_name, column_name),
            Precondition::ViewExists {
                schema_name,
                view_name,
            } => self.dialect.view_exists(conn, schema_or(schema_name, default_schema), view_name),
            Precondition::IndexExists {
                schema_name,
                index_name,
            } => self.dialect.index_exists(conn, schema_or(schema_name, default_schema), index_name),
            Precondition::SqlCheck {
                expected_result,
                sql,
            } => {
                let value: Value = conn.query_row(sql, [], |row| row.get(0))?;
                let actual = match value {
                    Value::Null => "NULL".to_string(),
                    Value::Integer(i) => i.to_string(),
                    Value::Real(f) => f.to_string(),
                    Value::Text(s) => s,
                    Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
                };
                Ok(actual.trim() == expected_result.trim())
            }
            Precondition::Not(inner) => {
                for condition in inner {
                    if self.precondition_holds(conn, condition)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Drop every table, view and trigger in the default schema except the lock table.
    pub fn drop_all(&self, conn: &mut Connection) -> Result<(), Error> {
        self.with_lock(conn, |conn| self.drop_all_locked(conn))
    }

    fn drop_all_locked(&self, conn: &mut Connection) -> Result<(), Error> {
        let statements = self.dialect.drop_all_statements(
            conn,
            self.default_schema.as_deref(),
            &[self.lock_table.as_str()],
        )?;
        tracing::warn!(objects = statements.len(), "Dropping all database objects");
        let tx = conn.transaction()?;
        for statement in &statements {
            tx.execute_batch(statement)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Applied changesets recorded after the last row tagged `tag`, in application order.
    fn rollback_targets<'c>(
        &self,
        changelog: &'c ChangeLog,
        history: &[HistoryRecord],
        tag: &str,
        ctx: &RunContext,
    ) -> Result<Vec<&'c ChangeSet>, Error> {
        let tagged_at = history
            .iter()
            .filter(|r| r.tag.as_deref() == Some(tag))
            .map(|r| r.order_executed)
            .max()
            .ok_or_else(|| Error::UnknownTag(tag.to_string()))?;

        let mut latest: Vec<&HistoryRecord> = latest_by_identity(history)
            .into_values()
            .filter(|r| r.order_executed > tagged_at)
            .collect();
        latest.sort_by_key(|r| r.order_executed);

        let mut targets = Vec::new();
        for record in latest {
            let identity = record.identity();
            let change_set = changelog.find(&identity).ok_or_else(|| Error::NoRollbackAvailable {
                changeset: identity.to_string(),
                reason: "the changeset is no longer in the changelog".to_string(),
            })?;
            if ctx.selects(change_set) {
                targets.push(change_set);
            }
        }
        Ok(targets)
    }

    /// Undo every changeset applied after `tag`, newest first. Returns what was rolled back.
    pub fn rollback_to_tag(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        tag: &str,
        ctx: &RunContext,
    ) -> Result<Vec<ChangeSetId>, Error> {
        let _span = tracing::info_span!("rollback", changelog = %changelog.path, tag).entered();
        self.with_lock(conn, |conn| {
            let records = self.history_store().records(conn)?;
            let targets = self.rollback_targets(changelog, &records, tag, ctx)?;
            self.roll_back(conn, &targets)
        })
    }

    /// Roll back `change_sets` (given in application order). Every rollback is resolved
    /// before anything executes.
    fn roll_back(
        &self,
        conn: &mut Connection,
        change_sets: &[&ChangeSet],
    ) -> Result<Vec<ChangeSetId>, Error> {
        let resolved = change_sets
            .iter()
            .rev()
            .map(|cs| rollback_changes(cs).map(|changes| (*cs, changes)))
            .collect::<Result<Vec<_>, _>>()?;
        let store = self.history_store();
        let mut rolled_back = Vec::new();
        for (change_set, changes) in resolved {
            let identity = change_set.identity();
            let _span = tracing::info_span!("change_set_rollback", id = %identity).entered();
            let result = (|| -> Result<(), Error> {
                let tx = conn.transaction()?;
                for change in &changes {
                    for statement in self
                        .dialect
                        .generate_sql(change, self.default_schema.as_deref())?
                    {
                        tx.execute_batch(&statement)?;
                    }
                }
                store.remove(&tx, &identity)?;
                tx.commit()?;
                Ok(())
            })();
            if let Err(e) = result {
                tracing::error!(error = %e, "Rollback failed");
                return Err(execution_error(&identity, e));
            }
            tracing::info!("Rolled back changeset");
            rolled_back.push(identity);
        }
        Ok(rolled_back)
    }

    /// SQL that [Migrator::rollback_to_tag] would run. Does not modify the database.
    pub fn rollback_to_tag_sql(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        tag: &str,
        ctx: &RunContext,
    ) -> Result<String, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let store = self.history_store();
        let records = store.records(conn)?;
        let targets = self.rollback_targets(changelog, &records, tag, ctx)?;
        let scripts =
            RollbackGenerator::new(self.dialect.as_ref(), self.default_schema.as_deref(), &store)
                .generate(&targets)?;
        Ok(rollback::render(&changelog.path, &scripts))
    }

    /// SQL that would undo the changesets an update with `ctx` is about to apply.
    /// Does not modify the database.
    pub fn future_rollback_sql(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        ctx: &RunContext,
    ) -> Result<String, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let store = self.history_store();
        let records = store.records(conn)?;
        let plan = self.plan(changelog, &records, ctx)?;
        let scripts =
            RollbackGenerator::new(self.dialect.as_ref(), self.default_schema.as_deref(), &store)
                .generate(&plan.pending)?;
        Ok(rollback::render(&changelog.path, &scripts))
    }

    /// Update, roll back what the update executed, then update again. Proves each applied
    /// changeset can be undone.
    pub fn update_testing_rollback(
        &self,
        conn: &mut Connection,
        changelog: &ChangeLog,
        ctx: &RunContext,
    ) -> Result<UpdateReport, Error> {
        let _span = tracing::info_span!("update_testing_rollback", changelog = %changelog.path)
            .entered();
        self.with_lock(conn, |conn| {
            let first = self.update_locked(conn, changelog, ctx)?;
            let applied = first
                .change_sets_run
                .iter()
                .filter_map(|identity| changelog.find(identity))
                .collect::<Vec<_>>();
            self.roll_back(conn, &applied)?;
            let again = RunContext {
                drop_first: false,
                rollback_file: None,
                ..ctx.clone()
            };
            let mut second = self.update_locked(conn, changelog, &again)?;
            second.dropped_first = first.dropped_first;
            second.rollback_file = first.rollback_file;
            second.rollback_error = first.rollback_error;
            Ok(second)
        })
    }

    /// Changesets an update with `ctx` would apply. Does not modify the database.
    pub fn status<'c>(
        &self,
        conn: &mut Connection,
        changelog: &'c ChangeLog,
        ctx: &RunContext,
    ) -> Result<Vec<&'c ChangeSet>, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let records = self.history_store().records(conn)?;
        Ok(self.plan(changelog, &records, ctx)?.pending)
    }

    /// Check recorded checksums against the changelog without applying anything.
    pub fn validate(&self, conn: &mut Connection, changelog: &ChangeLog) -> Result<(), Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let records = self.history_store().records(conn)?;
        history::validate(changelog, &records)
    }

    /// All history rows in execution order.
    pub fn history(&self, conn: &mut Connection) -> Result<Vec<HistoryRecord>, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        self.history_store().records(conn)
    }

    /// Tag the most recently applied changeset.
    pub fn tag(&self, conn: &mut Connection, tag: &str) -> Result<(), Error> {
        self.with_lock(conn, |conn| {
            let store = self.history_store();
            store.ensure_table(conn)?;
            store.tag_last(conn, tag)
        })
    }

    /// Clear the lock row whoever holds it. Returns the previous holder, if the lock was held.
    pub fn release_locks(&self, conn: &mut Connection) -> Result<Option<LockRecord>, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        self.lock_manager().force_release(conn)
    }

    /// Current lock row.
    pub fn lock_status(&self, conn: &mut Connection) -> Result<LockRecord, Error> {
        conn.busy_timeout(self.busy_timeout)?;
        let lock = self.lock_manager();
        lock.ensure_table(conn)?;
        lock.current(conn)
    }
}

fn execution_error(identity: &ChangeSetId, source: Error) -> Error {
    Error::Execution {
        changeset: identity.to_string(),
        source: Box::new(source),
    }
}

fn describe_precondition(condition: &Precondition) -> String {
    match condition {
        Precondition::TableExists { table_name, .. } => format!("table '{}' does not exist", table_name),
        Precondition::ColumnExists {
            table_name,
            column_name,
            ..
        } => format!("column '{}.{}' does not exist", table_name, column_name),
        Precondition::ViewExists { view_name, .. } => format!("view '{}' does not exist", view_name),
        Precondition::IndexExists { index_name, .. } => {
            format!("index '{}' does not exist", index_name)
        }
        Precondition::SqlCheck {
            expected_result,
            sql,
        } => format!("'{}' did not return '{}'", sql, expected_result),
        Precondition::Not(_) => "a negated condition holds".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeLogParser;
    use crate::resource::MemoryResourceAccessor;
    use std::sync::{Arc, Mutex};

    const THREE_CHANGESETS: &str = r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - createTable:
            tableName: t
            columns:
              - column: { name: id, type: INTEGER, constraints: { primaryKey: true } }
  - changeSet:
      id: "2"
      author: alice
      changes:
        - addColumn:
            tableName: t
            columns:
              - column: { name: x, type: TEXT, defaultValue: none }
  - changeSet:
      id: "3"
      author: alice
      runAlways: true
      changes:
        - insert:
            tableName: t
            columns:
              - column: { name: x, value: default }
      rollback:
        - sql: { sql: "DELETE FROM t WHERE x = 'default'" }
"#;

    fn parse(content: &str) -> ChangeLog {
        let accessor = MemoryResourceAccessor::new().with("master.yaml", content);
        ChangeLogParser::new(&accessor).parse("master.yaml").unwrap()
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn ids(identities: &[ChangeSetId]) -> Vec<&str> {
        identities.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn run_always_changeset_reruns_and_appends_history() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(THREE_CHANGESETS);
        let migrator = Migrator::new();

        let first = migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert!(!first.history_table_existed);
        assert_eq!(ids(&first.change_sets_run), vec!["1", "2", "3"]);
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 3);

        let second = migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert!(second.history_table_existed);
        assert_eq!(ids(&second.change_sets_run), vec!["3"]);
        assert_ne!(first.deployment_id, second.deployment_id);

        let history = migrator.history(&mut conn).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].identity(), history[2].identity());
        assert_eq!(history[2].exec_type, ExecType::Executed);
        assert_eq!(history[3].exec_type, ExecType::Reran);
        assert!(history[3].date_executed >= history[2].date_executed);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM t"), 2);
    }

    #[test]
    fn second_update_is_idempotent_for_run_once_changesets() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
"#,
        );
        let migrator = Migrator::new();
        migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert!(migrator
            .status(&mut conn, &changelog, &RunContext::default())
            .unwrap()
            .is_empty());
        let report = migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert!(report.change_sets_run.is_empty());
    }

    #[test]
    fn modified_run_once_changeset_fails_validation() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new();
        let original = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
"#,
        );
        migrator
            .update(&mut conn, &original, &RunContext::default())
            .unwrap();

        let modified = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER, name TEXT)" }
"#,
        );
        assert!(matches!(
            migrator.update(&mut conn, &modified, &RunContext::default()),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            migrator.validate(&mut conn, &modified),
            Err(Error::ChecksumMismatch { .. })
        ));
        // nothing reapplied and the lock is free again
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 1);
        assert!(!migrator.lock_status(&mut conn).unwrap().locked);
    }

    #[test]
    fn edited_literal_whitespace_is_a_modification() {
        let mut conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new();
        let changelog = |value: &str| {
            parse(&format!(
                r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - createTable:
            tableName: t
            columns:
              - column: {{ name: x, type: TEXT }}
  - changeSet:
      id: "2"
      author: alice
      changes:
        - insert:
            tableName: t
            columns:
              - column: {{ name: x, value: "{}" }}
"#,
                value
            ))
        };
        migrator
            .update(&mut conn, &changelog("a  b"), &RunContext::default())
            .unwrap();
        assert!(matches!(
            migrator.update(&mut conn, &changelog("a b"), &RunContext::default()),
            Err(Error::ChecksumMismatch { .. })
        ));
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_updates_apply_changelog_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let workers = 4;
        let barrier = Arc::new(std::sync::Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut conn = Connection::open(&path).unwrap();
                    conn.busy_timeout(Duration::from_secs(10)).unwrap();
                    let changelog = parse(THREE_CHANGESETS);
                    let migrator = Migrator::new().with_lock_settings(LockSettings {
                        timeout: Duration::from_secs(20),
                        poll_interval: Duration::from_millis(10),
                        stale_after: None,
                    });
                    barrier.wait();
                    migrator
                        .update(&mut conn, &changelog, &RunContext::default())
                        .map(|report| report.change_sets_run.len())
                        .map_err(|e| e.to_string())
                })
            })
            .collect();
        let mut runs: Vec<usize> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect();
        runs.sort_unstable();

        // one full pass; the others only rerun the runAlways changeset
        assert_eq!(runs, vec![1, 1, 1, 3]);
        let mut conn = Connection::open(&path).unwrap();
        let migrator = Migrator::new();
        let history = migrator.history(&mut conn).unwrap();
        assert_eq!(history.len(), 3 + (workers - 1));
        let executed: Vec<&str> = history
            .iter()
            .filter(|record| record.exec_type == ExecType::Executed)
            .map(|record| record.id.as_str())
            .collect();
        assert_eq!(executed, vec!["1", "2", "3"]);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM t"), workers as i64);
        assert!(!migrator.lock_status(&mut conn).unwrap().locked);
    }

    #[test]
    fn failure_keeps_earlier_changesets_and_releases_lock() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
  - changeSet:
      id: "2"
      author: alice
      changes:
        - sql: { sql: "INSERT INTO a VALUES (1)" }
  - changeSet:
      id: "3"
      author: alice
      changes:
        - sql: { sql: "INSERT INTO a VALUES (2)" }
        - sql: { sql: "INSERT INTO missing VALUES (1)" }
  - changeSet:
      id: "4"
      author: alice
      changes:
        - sql: { sql: "INSERT INTO a VALUES (4)" }
"#,
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let captured = errors.clone();
        let migrator = Migrator::new().on_change_set_error(move |identity, _| {
            captured.lock().unwrap().push(identity.id.clone());
        });

        match migrator.update(&mut conn, &changelog, &RunContext::default()) {
            Err(Error::Execution { changeset, source }) => {
                assert_eq!(changeset, "master.yaml::3::alice");
                assert!(matches!(*source, Error::Rusqlite(_)));
            }
            other => panic!("expected execution error, got {:?}", other),
        }
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 2);
        // changeset 3's first statement was rolled back with its transaction
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM a"), 1);
        assert!(!migrator.lock_status(&mut conn).unwrap().locked);
        assert_eq!(*errors.lock().unwrap(), vec!["3".to_string()]);
    }

    #[test]
    fn lock_held_elsewhere_aborts_without_mutation() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(THREE_CHANGESETS);
        let mut other = LockManager::new(
            &SqliteDialect,
            None,
            DEFAULT_LOCK_TABLE_NAME,
            LockSettings::default(),
        )
        .with_owner("other-process");
        other.acquire(&conn).unwrap();

        let migrator = Migrator::new().with_lock_settings(LockSettings {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            stale_after: None,
        });
        assert!(matches!(
            migrator.update(&mut conn, &changelog, &RunContext::default()),
            Err(Error::LockTimeout { locked_by, .. }) if locked_by == "other-process"
        ));
        assert!(migrator.history(&mut conn).unwrap().is_empty());
        assert!(!SqliteDialect.table_exists(&conn, None, "t").unwrap());
    }

    #[test]
    fn contexts_and_labels_filter_changesets() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: base
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
  - changeSet:
      id: dev-data
      author: alice
      context: dev
      changes:
        - sql: { sql: "INSERT INTO a VALUES (1)" }
  - changeSet:
      id: experimental
      author: alice
      labels: experimental
      changes:
        - sql: { sql: "INSERT INTO a VALUES (2)" }
"#,
        );
        let skipped = Arc::new(Mutex::new(Vec::new()));
        let captured = skipped.clone();
        let migrator = Migrator::new().on_change_set_skipped(move |identity, _| {
            captured.lock().unwrap().push(identity.id.clone());
        });
        let ctx = RunContext::default()
            .with_contexts("prod")
            .with_labels("!experimental")
            .unwrap();
        let report = migrator.update(&mut conn, &changelog, &ctx).unwrap();
        assert_eq!(ids(&report.change_sets_run), vec!["base"]);
        assert_eq!(ids(&report.change_sets_skipped), vec!["dev-data", "experimental"]);
        assert_eq!(*skipped.lock().unwrap(), vec!["dev-data", "experimental"]);

        // skipped changesets stay pending for a later run that selects them
        let report = migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert_eq!(ids(&report.change_sets_run), vec!["dev-data", "experimental"]);
    }

    const TAGGED: &str = r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - createTable:
            tableName: a
            columns:
              - column: { name: id, type: INTEGER }
  - changeSet:
      id: "2"
      author: alice
      changes:
        - tagDatabase: { tag: v1 }
  - changeSet:
      id: "3"
      author: alice
      changes:
        - createTable:
            tableName: b
            columns:
              - column: { name: id, type: INTEGER }
  - changeSet:
      id: "4"
      author: alice
      changes:
        - addColumn:
            tableName: a
            columns:
              - column: { name: name, type: TEXT }
"#;

    #[test]
    fn update_stops_at_tag() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(TAGGED);
        let migrator = Migrator::new();
        let report = migrator
            .update(&mut conn, &changelog, &RunContext::default().with_tag("v1"))
            .unwrap();
        assert_eq!(ids(&report.change_sets_run), vec!["1", "2"]);
        let history = migrator.history(&mut conn).unwrap();
        assert_eq!(history[1].tag.as_deref(), Some("v1"));

        assert!(matches!(
            migrator.update(&mut conn, &changelog, &RunContext::default().with_tag("v9")),
            Err(Error::UnknownTag(tag)) if tag == "v9"
        ));
    }

    #[test]
    fn rollback_to_tag_undoes_later_changesets() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(TAGGED);
        let migrator = Migrator::new();
        migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert!(SqliteDialect.column_exists(&conn, None, "a", "name").unwrap());

        let preview = migrator
            .rollback_to_tag_sql(&mut conn, &changelog, "v1", &RunContext::default())
            .unwrap();
        assert!(preview.contains("ALTER TABLE \"a\" DROP COLUMN \"name\";"));
        assert!(preview.find("DROP COLUMN").unwrap() < preview.find("DROP TABLE \"b\"").unwrap());

        let rolled_back = migrator
            .rollback_to_tag(&mut conn, &changelog, "v1", &RunContext::default())
            .unwrap();
        assert_eq!(ids(&rolled_back), vec!["4", "3"]);
        assert!(!SqliteDialect.table_exists(&conn, None, "b").unwrap());
        assert!(!SqliteDialect.column_exists(&conn, None, "a", "name").unwrap());
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 2);

        assert!(matches!(
            migrator.rollback_to_tag(&mut conn, &changelog, "nope", &RunContext::default()),
            Err(Error::UnknownTag(_))
        ));
    }

    #[test]
    fn rollback_preview_is_byte_identical_and_read_only() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(TAGGED);
        let migrator = Migrator::new();
        let first = migrator
            .future_rollback_sql(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        let second = migrator
            .future_rollback_sql(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert_eq!(first, second);
        assert!(migrator.history(&mut conn).unwrap().is_empty());
        assert!(!SqliteDialect.table_exists(&conn, None, "a").unwrap());
    }

    #[test]
    fn rollback_file_failure_does_not_block_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: "1"
      author: alice
      changes:
        - sql: { sql: "CREATE TABLE a (id INTEGER)" }
"#,
        );
        let ctx = RunContext::default().with_rollback_file(dir.path().join("rollback.sql"));
        let report = Migrator::new().update(&mut conn, &changelog, &ctx).unwrap();
        assert_eq!(ids(&report.change_sets_run), vec!["1"]);
        assert!(report.rollback_file.is_none());
        assert!(report
            .rollback_error
            .unwrap()
            .contains("no rollback available"));
    }

    #[test]
    fn rollback_file_is_written_before_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollback.sql");
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(TAGGED);
        let ctx = RunContext::default().with_rollback_file(&path);
        let report = Migrator::new().update(&mut conn, &changelog, &ctx).unwrap();
        assert_eq!(report.rollback_file.as_deref(), Some(path.as_path()));
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("-- "));
        assert!(written.contains("-- Rolling back changeset master.yaml::4::alice"));
    }

    #[test]
    fn precondition_policies() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(
            r#"
databaseChangeLog:
  - changeSet:
      id: mark
      author: alice
      preConditions:
        onFail: MARK_RAN
        conditions:
          - not:
              - tableExists: { tableName: legacy }
      changes:
        - sql: { sql: "CREATE TABLE marked (id INTEGER)" }
  - changeSet:
      id: continue
      author: alice
      preConditions:
        onFail: CONTINUE
        conditions:
          - sqlCheck: { expectedResult: "1", sql: "SELECT COUNT(*) FROM legacy" }
      changes:
        - sql: { sql: "CREATE TABLE continued (id INTEGER)" }
  - changeSet:
      id: halt
      author: alice
      preConditions:
        conditions:
          - tableExists: { tableName: nowhere }
      changes:
        - sql: { sql: "CREATE TABLE halted (id INTEGER)" }
"#,
        );
        conn.execute_batch("CREATE TABLE legacy (id INTEGER)").unwrap();
        let migrator = Migrator::new();
        match migrator.update(&mut conn, &changelog, &RunContext::default()) {
            Err(Error::PreconditionFailed { changeset, message }) => {
                assert_eq!(changeset, "master.yaml::halt::alice");
                assert!(message.contains("nowhere"));
            }
            other => panic!("expected precondition failure, got {:?}", other),
        }
        let history = migrator.history(&mut conn).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "mark");
        assert_eq!(history[0].exec_type, ExecType::MarkRan);
        assert!(!SqliteDialect.table_exists(&conn, None, "marked").unwrap());
        assert!(!SqliteDialect.table_exists(&conn, None, "continued").unwrap());
    }

    #[test]
    fn drop_first_preserves_lock_table() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(THREE_CHANGESETS);
        let migrator = Migrator::new();
        migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        conn.execute_batch("CREATE TABLE stray (id INTEGER)").unwrap();

        let report = migrator
            .update(
                &mut conn,
                &changelog,
                &RunContext::default().with_drop_first(true),
            )
            .unwrap();
        assert!(report.dropped_first);
        assert!(!report.history_table_existed);
        assert_eq!(ids(&report.change_sets_run), vec!["1", "2", "3"]);
        assert!(!SqliteDialect.table_exists(&conn, None, "stray").unwrap());
        assert!(SqliteDialect
            .table_exists(&conn, None, DEFAULT_LOCK_TABLE_NAME)
            .unwrap());
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 3);
    }

    #[test]
    fn update_testing_rollback_leaves_database_updated() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(TAGGED);
        let started = Arc::new(Mutex::new(0));
        let counter = started.clone();
        let migrator = Migrator::new().on_change_set_start(move |_| {
            *counter.lock().unwrap() += 1;
        });
        let report = migrator
            .update_testing_rollback(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        assert_eq!(ids(&report.change_sets_run), vec!["1", "2", "3", "4"]);
        assert_eq!(*started.lock().unwrap(), 8);
        assert_eq!(migrator.history(&mut conn).unwrap().len(), 4);
        assert!(SqliteDialect.column_exists(&conn, None, "a", "name").unwrap());
    }

    #[test]
    fn tag_and_release_locks() {
        let mut conn = Connection::open_in_memory().unwrap();
        let changelog = parse(THREE_CHANGESETS);
        let migrator = Migrator::new().with_applied_by("deployer");
        migrator
            .update(&mut conn, &changelog, &RunContext::default())
            .unwrap();
        migrator.tag(&mut conn, "release-1").unwrap();
        let history = migrator.history(&mut conn).unwrap();
        assert_eq!(history[2].tag.as_deref(), Some("release-1"));
        assert_eq!(history[2].applied_by.as_deref(), Some("deployer"));

        assert!(migrator.release_locks(&mut conn).unwrap().is_none());
    }
}
