//! `aqsql` is a facade crate re-exporting the async PostgreSQL client core:
//! the single-connection [`Database`](aqsql_postgres::Database) driver, the
//! [`Pool`](aqsql_postgres::Pool), [`Transaction`](aqsql_postgres::Transaction)
//! scopes, and the request-coalescing [`Cache`](aqsql_postgres::Cache).
//!
//! See the crate-level docs of `aqsql-postgres` for the full surface.

pub use aqsql_core::{CancelToken, ConnectOptions, Error, LogSettings, Result, WeakCancelToken};
pub use aqsql_postgres::{
    Cache, ConnectFactory, ConnectionState, Database, Executor, FromValue, Lease, PgResult,
    Pool, PoolConfig, PoolableHandle, PreparedQuery, Row, Transaction, Value,
};
