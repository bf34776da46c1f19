//! The PostgreSQL driver, pool, pipeline, transaction, and cache
//! implementation behind the `aqsql` facade.
//!
//! [`Database`] is one connection, driven by a background worker task
//! that owns the socket and the in-flight FIFO outright (see
//! [`driver`]). [`Pool`] lends `Database` handles out of a bounded,
//! named set. [`Transaction`] scopes a `BEGIN`/`COMMIT` pair with
//! rollback-on-drop. [`Cache`] sits in front of either one and coalesces
//! concurrent identical queries.

mod auth;
mod connect;
mod driver;
mod wire;

pub mod cache;
pub mod pool;
pub mod result;
pub mod transaction;
pub mod value;

pub use cache::{Cache, Executor};
pub use driver::{ConnectionState, Database, PipelineMode, PreparedQuery};
pub use pool::{ConnectFactory, Lease, Pool, PoolConfig, PoolableHandle};
pub use result::PgResult;
pub use transaction::Transaction;
pub use value::{FromValue, Row, Value};
