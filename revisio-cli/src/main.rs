//! Command line runner for revisio changelogs.
//!
//! Targets come either from a configuration file (`--config`, optionally `--target`) or from
//! a bare `--changelog` path. Changelog paths resolve against `--root`.

use std::path::PathBuf;

use clap::Parser;
use revisio::changelog::ChangeLog;
use revisio::config::{MigrationConfig, MigrationConfigs};
use revisio::resource::FileSystemResourceAccessor;
use revisio::{Migrator, RunContext};
use rusqlite::Connection;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revisio", version, about = "Apply database changelogs")]
struct Cli {
    /// SQLite database file to migrate
    #[arg(long, env = "REVISIO_DATABASE")]
    database: PathBuf,
    /// Configuration file (.yaml, .yml or .json) listing migration targets
    #[arg(long, conflicts_with = "changelog")]
    config: Option<PathBuf>,
    /// Target to use from the configuration file. Required when it lists more than one
    #[arg(long, requires = "config")]
    target: Option<String>,
    /// Changelog to apply when no configuration file is given
    #[arg(long)]
    changelog: Option<String>,
    /// Directory changelog paths resolve against
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Comma-separated contexts to run under
    #[arg(long)]
    contexts: Option<String>,
    /// Label expression selecting changesets
    #[arg(long)]
    labels: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Apply pending changesets
    Update {
        /// Stop after the changeset tagging the database with this name
        #[arg(long)]
        tag: Option<String>,
        /// Drop all database objects before updating
        #[arg(long)]
        drop_first: bool,
        /// Write SQL undoing this update to a file first
        #[arg(long)]
        rollback_file: Option<PathBuf>,
        /// Update, roll back, and update again
        #[arg(long)]
        test_rollback: bool,
    },
    /// List pending changesets
    Status,
    /// List applied changesets
    History,
    /// Check recorded checksums against the changelog
    Validate,
    /// Print SQL rolling back to a tag without running it
    RollbackSql { tag: String },
    /// Roll back every changeset applied after a tag
    Rollback { tag: String },
    /// Tag the most recently applied changeset
    Tag { tag: String },
    /// Show who holds the migration lock
    LockStatus,
    /// Clear the migration lock, whoever holds it
    ReleaseLock,
    /// Drop every table, view and trigger in the database
    DropAll {
        /// Confirm the drop
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    fn target(&self) -> Result<MigrationConfig, Box<dyn std::error::Error>> {
        let mut target = match (&self.config, &self.changelog) {
            (Some(path), _) => {
                let configs = MigrationConfigs::from_path(path)?;
                match &self.target {
                    Some(name) => configs
                        .get(name)
                        .cloned()
                        .ok_or_else(|| format!("no target named '{}' in {}", name, path.display()))?,
                    None => match configs.targets.as_slice() {
                        [only] => only.clone(),
                        [] => return Err(format!("{} lists no targets", path.display()).into()),
                        _ => {
                            return Err(format!(
                                "{} lists several targets, choose one with --target",
                                path.display()
                            )
                            .into())
                        }
                    },
                }
            }
            (None, Some(changelog)) => MigrationConfig::new("cli", changelog.clone()),
            (None, None) => return Err("either --config or --changelog is required".into()),
        };
        if let Some(contexts) = &self.contexts {
            target.contexts = Some(contexts.clone());
        }
        if let Some(labels) = &self.labels {
            target.labels = Some(labels.clone());
        }
        Ok(target)
    }
}

fn parse_changelog(
    target: &MigrationConfig,
    accessor: &FileSystemResourceAccessor,
) -> Result<ChangeLog, revisio::Error> {
    target.parser(accessor).parse(&target.change_log)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let target = cli.target()?;
    tracing::debug!(target_name = %target.name, change_log = %target.change_log, "Using target");
    let accessor = FileSystemResourceAccessor::new(&cli.root);
    let migrator: Migrator = target.migrator();
    let mut conn = Connection::open(&cli.database)?;

    match cli.command {
        Command::Update {
            tag,
            drop_first,
            rollback_file,
            test_rollback,
        } => {
            let changelog = parse_changelog(&target, &accessor)?;
            let mut ctx: RunContext = target.run_context()?;
            if let Some(tag) = tag {
                ctx = ctx.with_tag(tag);
            }
            if drop_first {
                ctx = ctx.with_drop_first(true);
            }
            if let Some(path) = rollback_file {
                ctx = ctx.with_rollback_file(path);
            }
            let report = if test_rollback || target.test_rollback_on_update {
                migrator.update_testing_rollback(&mut conn, &changelog, &ctx)?
            } else {
                migrator.update(&mut conn, &changelog, &ctx)?
            };
            for identity in &report.change_sets_run {
                println!("ran         {}", identity);
            }
            for identity in &report.change_sets_marked_ran {
                println!("marked ran  {}", identity);
            }
            for identity in &report.change_sets_skipped {
                println!("skipped     {}", identity);
            }
            if let Some(error) = &report.rollback_error {
                eprintln!("rollback file not written: {}", error);
            }
            println!(
                "{} changeset(s) applied, deployment {}",
                report.change_sets_run.len(),
                report.deployment_id
            );
        }
        Command::Status => {
            let changelog = parse_changelog(&target, &accessor)?;
            let ctx = target.run_context()?;
            let pending = migrator.status(&mut conn, &changelog, &ctx)?;
            for change_set in &pending {
                println!("{}", change_set.identity());
            }
            println!("{} changeset(s) pending", pending.len());
        }
        Command::History => {
            for record in migrator.history(&mut conn)? {
                println!(
                    "{:>4}  {}  {:<8}  {}{}",
                    record.order_executed,
                    record.date_executed.format("%Y-%m-%d %H:%M:%S"),
                    record.exec_type.as_str(),
                    record.identity(),
                    record
                        .tag
                        .as_deref()
                        .map(|tag| format!("  [{}]", tag))
                        .unwrap_or_default()
                );
            }
        }
        Command::Validate => {
            let changelog = parse_changelog(&target, &accessor)?;
            migrator.validate(&mut conn, &changelog)?;
            println!("{} changeset(s) valid", changelog.change_sets().len());
        }
        Command::RollbackSql { tag } => {
            let changelog = parse_changelog(&target, &accessor)?;
            let ctx = target.run_context()?;
            print!(
                "{}",
                migrator.rollback_to_tag_sql(&mut conn, &changelog, &tag, &ctx)?
            );
        }
        Command::Rollback { tag } => {
            let changelog = parse_changelog(&target, &accessor)?;
            let ctx = target.run_context()?;
            for identity in migrator.rollback_to_tag(&mut conn, &changelog, &tag, &ctx)? {
                println!("rolled back {}", identity);
            }
        }
        Command::Tag { tag } => {
            migrator.tag(&mut conn, &tag)?;
            println!("tagged {}", tag);
        }
        Command::LockStatus => {
            let record = migrator.lock_status(&mut conn)?;
            if record.locked {
                println!(
                    "locked by {} since {}",
                    record.locked_by.unwrap_or_default(),
                    record.locked_at.unwrap_or_default()
                );
            } else {
                println!("not locked");
            }
        }
        Command::ReleaseLock => match migrator.release_locks(&mut conn)? {
            Some(previous) => println!(
                "released lock held by {} since {}",
                previous.locked_by.unwrap_or_default(),
                previous.locked_at.unwrap_or_default()
            ),
            None => println!("lock was not held"),
        },
        Command::DropAll { yes } => {
            if !yes {
                return Err("drop-all destroys every table and view, pass --yes to confirm".into());
            }
            migrator.drop_all(&mut conn)?;
            println!("dropped all objects in {}", cli.database.display());
        }
    }
    Ok(())
}
