//! Backend-agnostic plumbing shared by `aqsql` drivers.
//!
//! This crate holds nothing PostgreSQL-specific: errors, the [`net::Socket`]
//! abstraction a driver is generic over, connection-string parsing,
//! logging configuration, the statement-name LRU cache, and the
//! [`CancelToken`] liveness-token pair used for receiver guards and
//! cancellable markers throughout `aqsql-postgres`.

mod cancel;
mod config;
mod error;
mod logging;

pub mod net;
pub mod statement_cache;

pub use cancel::{CancelToken, WeakCancelToken};
pub use config::{ConnectOptions, Target};
pub use error::{DbError, Error, Result};
pub use logging::LogSettings;
