use std::path::PathBuf;

/// Error type for the revisio crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to parse changelog '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("changelog resource '{0}' could not be found")]
    ResourceNotFound(String),
    #[error("cyclic changelog include: {}", chain.join(" -> "))]
    CyclicInclude { chain: Vec<String> },
    #[error("changeset {0} is declared more than once")]
    DuplicateChangeSet(String),
    #[error(
        "changeset {changeset} checksum mismatch. Recorded '{recorded}' but computed '{computed}'. \
        The changeset was modified after being applied"
    )]
    ChecksumMismatch {
        changeset: String,
        recorded: String,
        computed: String,
    },
    #[error("could not acquire the migration lock within {waited_ms}ms, held by {locked_by} since {locked_at}")]
    LockTimeout {
        waited_ms: u128,
        locked_by: String,
        locked_at: String,
    },
    #[error("changeset {changeset} failed: {source}")]
    Execution {
        changeset: String,
        #[source]
        source: Box<Error>,
    },
    #[error("precondition failed for changeset {changeset}: {message}")]
    PreconditionFailed { changeset: String, message: String },
    #[error("no rollback available for changeset {changeset}: {reason}")]
    NoRollbackAvailable { changeset: String, reason: String },
    #[error("unable to obtain a database connection: {0}")]
    Connection(String),
    #[error("tag '{0}' does not exist")]
    UnknownTag(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
