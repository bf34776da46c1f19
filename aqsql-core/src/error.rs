use std::fmt;

/// The error type produced by every fallible operation in `aqsql`.
///
/// Every variant here corresponds one-to-one with a row of the error table
/// in the driver specification: a lost connection, a per-query database
/// error, a pipeline aborted by a prior error, a malformed wire message, an
/// exhausted pool, or a pipeline-mode entry that was rejected.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The socket was closed or errored out from under an in-flight or
    /// buffered query. All queries queued on that driver fail with this
    /// variant, in FIFO order, and the driver transitions to `Disconnected`.
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] std::io::Error),

    /// The server returned an `ErrorResponse` for this specific query. Other
    /// queries on the same connection are unaffected, unless pipeline mode
    /// is active, in which case it also becomes `Aborted`.
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// This query was submitted to a connection whose pipeline is
    /// `Aborted` (a previous query in the same pipeline failed) and no
    /// `Sync` boundary has cleared it yet.
    #[error("pipeline aborted by a previous error; call pipeline_sync() to recover")]
    PipelineAborted,

    /// A message from the server didn't parse, or arrived out of the
    /// expected protocol sequence. Always fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A synchronous `Pool::database` call found the pool at its connection
    /// cap with no idle driver to hand out.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// `enter_pipeline_mode` was called while the in-flight FIFO was
    /// non-empty, or while the driver was not `Connected`.
    #[error("cannot enter pipeline mode: connection is busy or not connected")]
    InvalidPipelineEnter,

    /// The background worker task for a driver has stopped (usually because
    /// every handle referencing it, and the worker itself, have already
    /// been dropped) and can no longer accept commands.
    #[error("driver's background worker is no longer running")]
    WorkerCrashed,

    /// The pool named in a `Pool::get`/`Pool::database` call does not exist.
    #[error("no pool registered under the name {0:?}")]
    PoolNotFound(String),

    /// A `postgres://` connection URI failed to parse, or named an option
    /// this client doesn't understand well enough to act on safely.
    #[error("invalid connection configuration: {0}")]
    Configuration(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Ambient I/O failure that doesn't fit the connection-lifecycle
    /// variants above (e.g. resolving a Unix socket path).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Configuration(Box::new(err))
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// True for errors that mean "every query on this connection just
    /// failed, and the connection itself is now dead" as opposed to a
    /// per-query failure the connection survives.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::Protocol(_) | Error::WorkerCrashed
        )
    }
}

/// A structured error returned by the PostgreSQL server in an
/// `ErrorResponse` (or `NoticeResponse` promoted to an error by the caller).
#[derive(Debug, Clone)]
pub struct DbError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.severity, self.code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

pub type Result<T> = std::result::Result<T, Error>;
