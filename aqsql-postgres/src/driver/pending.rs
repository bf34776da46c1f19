use std::sync::Arc;

use aqsql_core::WeakCancelToken;
use tokio::sync::oneshot;

use crate::result::PgResult;
use crate::value::Value;
use aqsql_core::Result;

/// A query identifier the caller holds onto across calls so the driver's
/// statement cache can be keyed by something cheaper than comparing SQL
/// text, and so the same ad-hoc SQL built with `format!` still hits the
/// cache under one key instead of a fresh one each time.
#[derive(Debug, Clone)]
pub enum PreparedQuery {
    /// A `&'static str` known at the call site, e.g. a literal passed to
    /// `exec`. The common case.
    Literal(&'static str),
    /// SQL text assembled at runtime, shared so the cache key is cheap to
    /// clone even though it isn't `'static`.
    Dynamic(Arc<str>),
}

impl PreparedQuery {
    pub fn sql(&self) -> &str {
        match self {
            PreparedQuery::Literal(s) => s,
            PreparedQuery::Dynamic(s) => s,
        }
    }
}

impl From<&'static str> for PreparedQuery {
    fn from(s: &'static str) -> Self {
        PreparedQuery::Literal(s)
    }
}

impl From<Arc<str>> for PreparedQuery {
    fn from(s: Arc<str>) -> Self {
        PreparedQuery::Dynamic(s)
    }
}

impl From<String> for PreparedQuery {
    fn from(s: String) -> Self {
        PreparedQuery::Dynamic(Arc::from(s))
    }
}

/// The 6-tuple a submitted query becomes once it's in the driver's FIFO:
/// what to run, its parameters, where the result goes, and the two
/// liveness guards that can suppress delivery without breaking ordering.
pub struct PendingQuery {
    pub sql: PreparedQuery,
    pub params: Vec<Value>,
    pub respond: oneshot::Sender<Result<PgResult>>,
    pub receiver: Option<WeakCancelToken>,
    pub cancellable: Option<WeakCancelToken>,
    /// Set when this query was submitted while the pipeline was already
    /// `Aborted`: nothing was written to the socket for it, so it's
    /// completed with a synthetic `PipelineAborted` error the moment it
    /// reaches the front of the FIFO rather than by reading a response.
    pub synthetic_abort: bool,
    /// Whether a `Parse` was written for this query (cache miss), so the
    /// response reader knows to expect a leading `ParseComplete`.
    pub expects_parse_complete: bool,
}

impl PendingQuery {
    /// A query whose cancellable marker died before dispatch is dropped
    /// outright rather than written to the socket at all.
    pub fn is_live_to_dispatch(&self) -> bool {
        self.cancellable.as_ref().map(WeakCancelToken::is_live).unwrap_or(true)
    }

    /// Delivers `result`, silently dropping it if either liveness guard
    /// died while the query was in flight — the socket read still had to
    /// happen to preserve FIFO decoding, but nobody gets told. The
    /// receiver guard and the cancellable marker are checked independently:
    /// either one dying is enough to suppress delivery.
    pub fn complete(self, result: Result<PgResult>) {
        let receiver_alive = self.receiver.as_ref().map(WeakCancelToken::is_live).unwrap_or(true);
        let cancellable_alive = self.cancellable.as_ref().map(WeakCancelToken::is_live).unwrap_or(true);
        if receiver_alive && cancellable_alive {
            let _ = self.respond.send(result);
        }
    }
}
