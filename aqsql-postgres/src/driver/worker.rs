//! The background task that owns a connection: one per [`Database`].
//!
//! Grounded on the teacher's `connection::worker::Worker` (one task per
//! connection, driven by an unbounded channel of outgoing requests) and
//! its `pipeline::worker` main loop (a single `select!` over "a new
//! command arrived" vs. "the socket produced a message"). The FIFO lives
//! here as a plain `VecDeque`; because nothing else ever touches it,
//! there is nothing to lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use aqsql_core::net::BoxSocket;
use aqsql_core::{ConnectOptions, DbError, Error, Result};

use super::pending::PendingQuery;
use super::{ConnectionState, DriverCommand, PipelineMode};
use crate::result::PgResult;
use crate::value::{Row, Value};
use crate::wire::{self, Backend};

/// Implementation-defined: how many queries may accumulate in a pipeline
/// since the last `Sync` before the worker forces one, independent of
/// any configured auto-sync interval.
const AUTO_SYNC_QUERY_THRESHOLD: usize = 32;

enum FifoEntry {
    Query(PendingQuery),
    /// A bare `Sync` boundary with nothing else attached: the marker the
    /// response reader uses to know a `ReadyForQuery` is expected next.
    Sync,
}

struct State {
    socket: BoxSocket,
    options: ConnectOptions,
    fifo: VecDeque<FifoEntry>,
    stmt_cache: aqsql_core::statement_cache::StatementCache<String>,
    pipeline_mode: PipelineMode,
    pipeline_auto_sync: Option<Duration>,
    queries_since_sync: usize,
    last_sync_at: Instant,
}

pub(crate) async fn run(
    socket: BoxSocket,
    options: ConnectOptions,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut socket = socket;
    match handshake(&mut socket, &options).await {
        Ok(()) => {
            tracing::debug!("connection established");
            let _ = state_tx.send(ConnectionState::Connected);
        }
        Err(err) => {
            tracing::warn!(error = %err, "postgres handshake failed");
            let _ = state_tx.send(ConnectionState::Disconnected);
            return;
        }
    }

    let mut state = State {
        socket,
        stmt_cache: aqsql_core::statement_cache::StatementCache::new(options.statement_cache_capacity),
        options,
        fifo: VecDeque::new(),
        pipeline_mode: PipelineMode::Off,
        pipeline_auto_sync: None,
        queries_since_sync: 0,
        last_sync_at: Instant::now(),
    };

    loop {
        let sync_deadline = match (state.pipeline_mode, state.pipeline_auto_sync) {
            (PipelineMode::On, Some(interval)) => Some(state.last_sync_at + interval),
            _ => None,
        };

        tokio::select! {
            biased;

            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => {
                        if let Err(err) = handle_command(&mut state, cmd).await {
                            tracing::warn!(error = %err, "connection lost while handling command");
                            fail_all(&mut state, err);
                            let _ = state_tx.send(ConnectionState::Disconnected);
                            return;
                        }
                    }
                    None => return, // every Database handle was dropped
                }
            }

            _ = tokio::time::sleep_until(sync_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if sync_deadline.is_some() => {
                if let Err(err) = force_sync(&mut state).await {
                    fail_all(&mut state, err);
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
            }

            result = drain_one(&mut state), if !state.fifo.is_empty() => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "connection lost while reading response");
                    fail_all(&mut state, err);
                    let _ = state_tx.send(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}

async fn handshake(socket: &mut BoxSocket, options: &ConnectOptions) -> Result<()> {
    let mut buf = BytesMut::new();
    let database = options.database.as_deref();
    let mut params = options.runtime_params.clone();
    if let Some(app_name) = &options.application_name {
        params.insert("application_name".to_owned(), app_name.clone());
    }
    wire::encode_startup(&mut buf, &options.username, database, &params);
    socket.write_all(&buf).await.map_err(Error::ConnectionLost)?;

    loop {
        let Backend { tag, body } = wire::read_backend(socket).await?;
        match tag {
            wire::AUTHENTICATION => {
                let method = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                match method {
                    0 => {} // AuthenticationOk
                    3 => {
                        // cleartext password
                        let mut out = BytesMut::new();
                        wire::encode_password(&mut out, options.password.as_deref().unwrap_or_default());
                        socket.write_all(&out).await.map_err(Error::ConnectionLost)?;
                    }
                    5 => {
                        // md5, salt is the 4 bytes following the method tag
                        let salt = [body[4], body[5], body[6], body[7]];
                        let response = crate::auth::md5_password(
                            &options.username,
                            options.password.as_deref().unwrap_or_default(),
                            salt,
                        );
                        let mut out = BytesMut::new();
                        wire::encode_password(&mut out, &response);
                        socket.write_all(&out).await.map_err(Error::ConnectionLost)?;
                    }
                    other => {
                        return Err(Error::protocol(format!(
                            "unsupported authentication method {other} (SASL/SCRAM is out of scope)"
                        )));
                    }
                }
            }
            wire::BACKEND_KEY_DATA | wire::PARAMETER_STATUS => {
                // Not tracked: cancel requests and live parameter tracking
                // are both out of scope for this driver.
            }
            wire::ERROR_RESPONSE => {
                let fields = wire::decode_fields(body)?;
                return Err(Error::Database(db_error_from_fields(fields)));
            }
            wire::READY_FOR_QUERY => return Ok(()),
            other => {
                return Err(Error::protocol(format!("unexpected message {other:?} during startup")));
            }
        }
    }
}

async fn handle_command(state: &mut State, cmd: DriverCommand) -> Result<()> {
    match cmd {
        DriverCommand::Exec {
            sql,
            params,
            respond,
            receiver,
            cancellable,
        } => {
            let pending = PendingQuery {
                sql,
                params,
                respond,
                receiver,
                cancellable,
                synthetic_abort: false,
                expects_parse_complete: false,
            };
            dispatch(state, pending).await
        }

        DriverCommand::EnterPipeline { auto_sync, respond } => {
            let ok = state.fifo.is_empty() && !matches!(state.pipeline_mode, PipelineMode::Aborted);
            if ok {
                state.pipeline_mode = PipelineMode::On;
                state.pipeline_auto_sync = auto_sync;
                state.queries_since_sync = 0;
                state.last_sync_at = Instant::now();
                tracing::debug!(?auto_sync, "entered pipeline mode");
            }
            let _ = respond.send(ok);
            Ok(())
        }

        DriverCommand::PipelineSync { respond } => {
            let result = force_sync(state).await;
            let _ = respond.send(result);
            Ok(())
        }

        DriverCommand::ExitPipeline { respond } => {
            let result = force_sync(state).await;
            state.pipeline_mode = PipelineMode::Off;
            state.pipeline_auto_sync = None;
            let _ = respond.send(result);
            Ok(())
        }

        DriverCommand::PipelineStatus { respond } => {
            let _ = respond.send(state.pipeline_mode);
            Ok(())
        }
    }
}

async fn force_sync(state: &mut State) -> Result<()> {
    let mut buf = BytesMut::new();
    wire::encode_sync(&mut buf);
    state.socket.write_all(&buf).await.map_err(Error::ConnectionLost)?;
    state.fifo.push_back(FifoEntry::Sync);
    state.queries_since_sync = 0;
    state.last_sync_at = Instant::now();
    Ok(())
}

async fn dispatch(state: &mut State, pending: PendingQuery) -> Result<()> {
    if !pending.is_live_to_dispatch() {
        return Ok(()); // cancellable marker died before dispatch; drop it silently
    }

    if state.pipeline_mode == PipelineMode::Aborted {
        let mut pending = pending;
        pending.synthetic_abort = true;
        state.fifo.push_back(FifoEntry::Query(pending));
        return Ok(());
    }

    let sql = pending.sql.sql().to_owned();
    let cache_enabled = state.stmt_cache.is_enabled();
    let (statement_name, expects_parse) = if cache_enabled {
        if let Some(name) = state.stmt_cache.get_mut(&sql) {
            (name.clone(), false)
        } else {
            let name = statement_name_for(&sql);
            state.stmt_cache.insert(&sql, name.clone());
            (name, true)
        }
    } else {
        (String::new(), true)
    };

    tracing::debug!(sql = %sql, statement_name = %statement_name, cache_hit = !expects_parse, "dispatching query");

    let should_sync = state.pipeline_mode != PipelineMode::On
        || state.queries_since_sync + 1 >= AUTO_SYNC_QUERY_THRESHOLD;

    let params: Vec<Option<Vec<u8>>> = pending.params.iter().map(Value::encode_text).collect();

    let mut buf = BytesMut::new();
    if expects_parse {
        wire::encode_parse(&mut buf, &statement_name, &sql);
    }
    wire::encode_bind(&mut buf, "", &statement_name, &params);
    wire::encode_describe_portal(&mut buf, "");
    wire::encode_execute(&mut buf, "", 0);
    if should_sync {
        wire::encode_sync(&mut buf);
    }
    state.socket.write_all(&buf).await.map_err(Error::ConnectionLost)?;

    let mut pending = pending;
    pending.expects_parse_complete = expects_parse;
    state.fifo.push_back(FifoEntry::Query(pending));

    if should_sync {
        state.fifo.push_back(FifoEntry::Sync);
        state.queries_since_sync = 0;
        state.last_sync_at = Instant::now();
    } else {
        state.queries_since_sync += 1;
    }

    Ok(())
}

/// Processes exactly one [`FifoEntry`] off the front of the queue: either
/// a synthetic abort (no I/O), a bare `Sync` (reads one `ReadyForQuery`),
/// or a real query (reads its whole response sequence).
async fn drain_one(state: &mut State) -> Result<()> {
    match state.fifo.pop_front().expect("guarded by select! on non-empty fifo") {
        FifoEntry::Query(pending) if pending.synthetic_abort => {
            pending.complete(Err(Error::PipelineAborted));
            Ok(())
        }
        FifoEntry::Query(pending) => read_query_response(state, pending).await,
        FifoEntry::Sync => read_ready_for_query(state).await,
    }
}

async fn read_query_response(state: &mut State, pending: PendingQuery) -> Result<()> {
    if pending.expects_parse_complete {
        let msg = wire::read_backend(&mut state.socket).await?;
        if msg.tag == wire::ERROR_RESPONSE {
            return fail_query(state, pending, msg).await;
        }
        if msg.tag != wire::PARSE_COMPLETE {
            return Err(Error::protocol(format!("expected ParseComplete, got {:?}", msg.tag as char)));
        }
    }

    let bind = wire::read_backend(&mut state.socket).await?;
    if bind.tag == wire::ERROR_RESPONSE {
        return fail_query(state, pending, bind).await;
    }
    if bind.tag != wire::BIND_COMPLETE {
        return Err(Error::protocol(format!("expected BindComplete, got {:?}", bind.tag as char)));
    }

    let describe = wire::read_backend(&mut state.socket).await?;
    let columns = match describe.tag {
        wire::ROW_DESCRIPTION => Arc::new(wire::decode_row_description(describe.body)?),
        wire::NO_DATA => Arc::new(Vec::new()),
        wire::ERROR_RESPONSE => return fail_query(state, pending, describe).await,
        other => return Err(Error::protocol(format!("expected RowDescription/NoData, got {other:?}"))),
    };

    let mut rows = Vec::new();
    loop {
        let msg = wire::read_backend(&mut state.socket).await?;
        match msg.tag {
            wire::DATA_ROW => {
                let raw = wire::decode_data_row(msg.body)?;
                let values = raw
                    .into_iter()
                    .map(|cell| match cell {
                        Some(bytes) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
                        None => Value::Null,
                    })
                    .collect();
                rows.push(Row {
                    columns: columns.clone(),
                    values,
                });
            }
            wire::COMMAND_COMPLETE => {
                let tag = wire::decode_command_complete(msg.body)?;
                let rows_affected = tag
                    .rsplit(' ')
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(rows.len() as u64);
                tracing::debug!(command_tag = %tag, rows_affected, "query completed");
                pending.complete(Ok(PgResult::new(rows, tag, rows_affected)));
                return Ok(());
            }
            wire::EMPTY_QUERY_RESPONSE => {
                tracing::debug!("query completed with an empty query response");
                pending.complete(Ok(PgResult::new(Vec::new(), String::new(), 0)));
                return Ok(());
            }
            wire::ERROR_RESPONSE => return fail_query(state, pending, msg).await,
            wire::PORTAL_SUSPENDED => continue,
            other => return Err(Error::protocol(format!("unexpected message {other:?} in result stream"))),
        }
    }
}

async fn fail_query(state: &mut State, pending: PendingQuery, error_msg: Backend) -> Result<()> {
    let fields = wire::decode_fields(error_msg.body)?;
    let db_error = db_error_from_fields(fields);
    if state.pipeline_mode == PipelineMode::On {
        state.pipeline_mode = PipelineMode::Aborted;
        tracing::debug!("pipeline aborted by query error");
    }
    tracing::debug!(error = %db_error, "query failed");
    pending.complete(Err(Error::Database(db_error)));
    Ok(())
}

async fn read_ready_for_query(state: &mut State) -> Result<()> {
    let msg = wire::read_backend(&mut state.socket).await?;
    if msg.tag != wire::READY_FOR_QUERY {
        return Err(Error::protocol(format!("expected ReadyForQuery, got {:?}", msg.tag as char)));
    }
    if state.pipeline_mode == PipelineMode::Aborted {
        state.pipeline_mode = PipelineMode::On;
        tracing::debug!("pipeline cleared by sync");
    }
    Ok(())
}

/// Derives a server-side prepared-statement name deterministically from
/// the SQL text itself (FNV-1a), rather than from an incrementing
/// per-connection counter — the same literal query gets the same name
/// regardless of which pooled connection or connection generation runs it.
fn statement_name_for(sql: &str) -> String {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    let mut hash = OFFSET_BASIS;
    for byte in sql.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    format!("aqsql_{hash:016x}")
}

fn db_error_from_fields(fields: BTreeMap<u8, String>) -> DbError {
    DbError {
        severity: fields.get(&b'S').cloned().unwrap_or_else(|| "ERROR".to_owned()),
        code: fields.get(&b'C').cloned().unwrap_or_else(|| "XX000".to_owned()),
        message: fields.get(&b'M').cloned().unwrap_or_else(|| "unknown error".to_owned()),
        detail: fields.get(&b'D').cloned(),
    }
}

fn fail_all(state: &mut State, err: Error) {
    for entry in state.fifo.drain(..) {
        if let FifoEntry::Query(pending) = entry {
            pending.complete(Err(clone_for_broadcast(&err)));
        }
    }
}

/// `Error` doesn't implement `Clone` (its I/O variants can't), so a
/// connection-fatal error is re-described per recipient instead of
/// cloned. Every recipient still gets an error that `is_connection_fatal`.
fn clone_for_broadcast(err: &Error) -> Error {
    Error::ConnectionLost(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
}
