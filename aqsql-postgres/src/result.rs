use std::sync::Arc;

use crate::value::Row;

/// The outcome of one statement: the rows it produced (empty for DDL/DML
/// with no `RETURNING`) and the `CommandComplete` tag (`"INSERT 0 3"`,
/// `"SELECT 2"`, ...) the server reported.
///
/// Cheap to clone: a successful result is shared verbatim between the
/// cache's coalesced waiters, so it's built once behind an `Arc` and every
/// caller gets a clone of the same rows.
#[derive(Debug, Clone)]
pub struct PgResult {
    inner: Arc<PgResultInner>,
}

#[derive(Debug)]
struct PgResultInner {
    rows: Vec<Row>,
    command_tag: String,
    rows_affected: u64,
}

impl PgResult {
    pub(crate) fn new(rows: Vec<Row>, command_tag: String, rows_affected: u64) -> Self {
        PgResult {
            inner: Arc::new(PgResultInner {
                rows,
                command_tag,
                rows_affected,
            }),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.inner.rows
    }

    pub fn command_tag(&self) -> &str {
        &self.inner.command_tag
    }

    pub fn rows_affected(&self) -> u64 {
        self.inner.rows_affected
    }
}
