//! One PostgreSQL connection: socket I/O, protocol state machine,
//! per-query FIFO, and pipeline mode.
//!
//! The actual connection state lives in a single background task (see
//! [`worker`]) that owns the socket, the FIFO, and the pipeline state
//! machine outright. Every [`Database`] is a cheap, `Clone`-able handle
//! that talks to that task over an unbounded `tokio::sync::mpsc` channel.
//! Because exactly one task ever touches the mutable state, the FIFO
//! ordering invariant (`spec.md` §4.1) falls out of the channel's own
//! ordering guarantee rather than a lock.

mod pending;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use aqsql_core::net::BoxSocket;
use aqsql_core::{ConnectOptions, Error, Result};

pub use pending::PreparedQuery;

use crate::pool::PoolableHandle;
use crate::result::PgResult;
use crate::value::Value;

/// `spec.md` §4.1's `state`: where the connection is in its lifecycle.
/// Broadcast to every handle via a `watch` channel so `on_state_changed`
/// observers don't need their own registration bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// `spec.md` §4.1's `pipelineMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Off,
    On,
    Aborted,
}

pub(crate) enum DriverCommand {
    Exec {
        sql: PreparedQuery,
        params: Vec<Value>,
        respond: oneshot::Sender<Result<PgResult>>,
        receiver: Option<aqsql_core::WeakCancelToken>,
        cancellable: Option<aqsql_core::WeakCancelToken>,
    },
    EnterPipeline {
        auto_sync: Option<Duration>,
        respond: oneshot::Sender<bool>,
    },
    PipelineSync {
        respond: oneshot::Sender<Result<()>>,
    },
    ExitPipeline {
        respond: oneshot::Sender<Result<()>>,
    },
    PipelineStatus {
        respond: oneshot::Sender<PipelineMode>,
    },
}

/// A cheap, shareable handle to one PostgreSQL connection.
///
/// Cloning a `Database` doesn't clone the connection: every clone sends
/// commands to the same background worker task, so mutation (pipeline
/// mode, the in-flight FIFO) is serialized through that one task no
/// matter how many handles exist.
#[derive(Clone)]
pub struct Database {
    commands: mpsc::UnboundedSender<DriverCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl Database {
    /// Connects and spawns the background worker. The returned handle's
    /// state starts at `Connecting` and flips to `Connected` (or
    /// `Disconnected`, on a handshake failure) once the startup exchange
    /// finishes.
    pub async fn connect(options: &ConnectOptions) -> Result<Self> {
        let socket = crate::connect::open_socket(options).await?;
        Ok(Self::spawn(socket, options.clone()))
    }

    pub(crate) fn spawn(socket: BoxSocket, options: ConnectOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(worker::run(socket, options, rx, state_tx));
        Database {
            commands: tx,
            state: state_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A `watch` receiver that observes every state transition. Mirrors
    /// `spec.md`'s `onStateChanged(receiver, cb)`: cloning it and
    /// `.changed().await`-ing is the receiver-guard pattern made
    /// structural — drop the clone to stop observing.
    pub fn on_state_changed(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Runs one query, ad-hoc or via a [`PreparedQuery`] key, with no
    /// cancellation or receiver guard attached.
    pub async fn exec(&self, sql: impl Into<PreparedQuery>, params: Vec<Value>) -> Result<PgResult> {
        self.exec_guarded(sql, params, None, None).await
    }

    /// The full form: an optional receiver guard (suppresses delivery if
    /// dead at completion) and cancellable marker (drops the query
    /// entirely if dead before dispatch), per `spec.md` §4.1.
    pub async fn exec_guarded(
        &self,
        sql: impl Into<PreparedQuery>,
        params: Vec<Value>,
        receiver: Option<aqsql_core::WeakCancelToken>,
        cancellable: Option<aqsql_core::WeakCancelToken>,
    ) -> Result<PgResult> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::Exec {
                sql: sql.into(),
                params,
                respond,
                receiver,
                cancellable,
            })
            .map_err(|_| Error::WorkerCrashed)?;
        rx.await.map_err(|_| Error::WorkerCrashed)?
    }

    /// Rejected (returns `false`, no state change) unless the in-flight
    /// FIFO is empty and the connection is `Connected`.
    pub async fn enter_pipeline_mode(&self, auto_sync: Option<Duration>) -> Result<bool> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::EnterPipeline { auto_sync, respond })
            .map_err(|_| Error::WorkerCrashed)?;
        rx.await.map_err(|_| Error::WorkerCrashed)
    }

    pub async fn pipeline_sync(&self) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::PipelineSync { respond })
            .map_err(|_| Error::WorkerCrashed)?;
        rx.await.map_err(|_| Error::WorkerCrashed)?
    }

    pub async fn exit_pipeline_mode(&self) -> Result<()> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::ExitPipeline { respond })
            .map_err(|_| Error::WorkerCrashed)?;
        rx.await.map_err(|_| Error::WorkerCrashed)?
    }

    pub async fn pipeline_status(&self) -> Result<PipelineMode> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::PipelineStatus { respond })
            .map_err(|_| Error::WorkerCrashed)?;
        rx.await.map_err(|_| Error::WorkerCrashed)
    }
}

impl PoolableHandle for Database {
    fn is_healthy(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }
}

impl crate::cache::Executor for Database {
    fn exec_raw(&self, sql: Arc<str>, params: Vec<Value>) -> futures_core::future::BoxFuture<'static, Result<PgResult>> {
        let db = self.clone();
        Box::pin(async move { db.exec(PreparedQuery::Dynamic(sql), params).await })
    }
}
