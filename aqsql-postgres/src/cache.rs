//! Request-coalescing, TTL-expiring result cache.
//!
//! Grounded directly on the original library's `ACache`: concurrent calls
//! for the same `(sql, params)` while a dispatch is already in flight
//! join that dispatch's waiter list instead of issuing a second query,
//! and a completed result stays valid for a fixed age before the next
//! caller forces a fresh dispatch. The original scans a `QMultiHash` of
//! `(sql, params)` keys linearly per lookup; here the same key is a
//! proper `HashMap` key, since nothing about the coalescing behavior
//! depends on the O(n) scan being the original's actual mechanism rather
//! than an implementation detail of its host language.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_core::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

use aqsql_core::{CancelToken, Error, Result, WeakCancelToken};

use crate::result::PgResult;
use crate::value::Value;

/// Anything a [`Cache`] can sit in front of: a single [`crate::Database`]
/// or a whole [`crate::Pool`]. Abstracted so the cache doesn't care
/// whether "dispatch to the database" means "use this one connection" or
/// "borrow one from the pool and give it back."
pub trait Executor: Send + Sync + 'static {
    fn exec_raw(&self, sql: Arc<str>, params: Vec<Value>) -> BoxFuture<'static, Result<PgResult>>;
}

type CacheKey = (Arc<str>, Vec<Value>);

struct CacheEntry {
    result: Option<PgResult>,
    completed_at: Option<Instant>,
    /// Each waiter carries its own optional receiver guard, mirroring
    /// `PendingQuery`'s receiver check: a waiter whose guard has died by
    /// the time the dispatch completes is skipped rather than delivered
    /// to, the same way the original's `QPointer<QObject> receiver`
    /// suppresses a callback into an object that's gone away.
    waiters: Vec<(oneshot::Sender<Result<PgResult>>, Option<WeakCancelToken>)>,
    /// Held by the detached dispatch task for as long as it's actually
    /// running. If that task panics before filling in `result`, this
    /// token's weak handle goes dead, and the next lookup treats the
    /// entry as abandoned rather than waiting on waiters that will never
    /// be signaled — the Rust analogue of the original's `QPointer`
    /// receiver-liveness check, here guarding the dispatcher itself
    /// instead of a receiver object.
    in_flight: Option<WeakCancelToken>,
}

struct CacheInner {
    upstream: Arc<dyn Executor>,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

#[derive(Clone)]
pub struct Cache(Arc<CacheInner>);

impl Cache {
    pub fn new(upstream: Arc<dyn Executor>, ttl: Duration) -> Self {
        Cache(Arc::new(CacheInner {
            upstream,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }))
    }

    /// Returns a cached result younger than `ttl`, joins an in-flight
    /// dispatch for the same key, or starts a new (detached) dispatch and
    /// becomes its first waiter.
    pub async fn exec(&self, sql: impl Into<Arc<str>>, params: Vec<Value>) -> Result<PgResult> {
        self.exec_guarded(sql, params, None).await
    }

    /// Like [`Cache::exec`], but checks freshness against `max_age`
    /// instead of the cache's own `ttl` for this call only — the original
    /// library's `execExpiring`, which lets one caller demand a fresher
    /// result than whatever the ambient cache policy would otherwise
    /// serve without forcing every other caller of the same key to do the
    /// same.
    pub async fn exec_expiring(&self, sql: impl Into<Arc<str>>, params: Vec<Value>, max_age: Duration) -> Result<PgResult> {
        self.exec_expiring_guarded(sql, params, max_age, None).await
    }

    /// [`Cache::exec`] with an attached receiver guard: if `receiver` dies
    /// before this call's result is delivered (because it coalesced onto
    /// someone else's dispatch), the caller is silently never woken
    /// instead of the channel being dropped out from under it.
    pub async fn exec_guarded(&self, sql: impl Into<Arc<str>>, params: Vec<Value>, receiver: Option<WeakCancelToken>) -> Result<PgResult> {
        self.exec_expiring_guarded(sql, params, self.0.ttl, receiver).await
    }

    pub async fn exec_expiring_guarded(
        &self,
        sql: impl Into<Arc<str>>,
        params: Vec<Value>,
        max_age: Duration,
        receiver: Option<WeakCancelToken>,
    ) -> Result<PgResult> {
        let sql = sql.into();
        let key: CacheKey = (sql.clone(), params.clone());

        enum Action {
            Hit(PgResult),
            Join(oneshot::Receiver<Result<PgResult>>),
            Dispatch(oneshot::Receiver<Result<PgResult>>),
        }

        let action = {
            let mut entries = self.0.entries.lock().expect("cache mutex poisoned");
            match entries.get_mut(&key) {
                Some(entry) if entry.result.is_some() && is_fresh(entry, max_age) => {
                    tracing::debug!(sql = %sql, "cache hit");
                    Action::Hit(entry.result.clone().expect("checked Some above"))
                }
                Some(entry) if entry.in_flight.as_ref().map(WeakCancelToken::is_live).unwrap_or(false) => {
                    tracing::debug!(sql = %sql, "coalescing onto in-flight dispatch");
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push((tx, receiver));
                    Action::Join(rx)
                }
                Some(entry) => {
                    tracing::debug!(sql = %sql, "cache stale or abandoned, redispatching");
                    let token = CancelToken::new();
                    entry.in_flight = Some(token.weak());
                    entry.result = None;
                    entry.completed_at = None;
                    let (tx, rx) = oneshot::channel();
                    entry.waiters = vec![(tx, receiver)];
                    drop(entries);
                    self.spawn_dispatch(key, sql, params, token);
                    Action::Dispatch(rx)
                }
                None => {
                    tracing::debug!(sql = %sql, "cache miss, dispatching");
                    let token = CancelToken::new();
                    let (tx, rx) = oneshot::channel();
                    entries.insert(
                        key.clone(),
                        CacheEntry {
                            result: None,
                            completed_at: None,
                            waiters: vec![(tx, receiver)],
                            in_flight: Some(token.weak()),
                        },
                    );
                    drop(entries);
                    self.spawn_dispatch(key, sql, params, token);
                    Action::Dispatch(rx)
                }
            }
        };

        match action {
            Action::Hit(result) => Ok(result),
            Action::Join(rx) => rx.await.map_err(|_| Error::WorkerCrashed)?,
            Action::Dispatch(rx) => rx.await.map_err(|_| Error::WorkerCrashed)?,
        }
    }

    /// Runs the upstream dispatch on its own task so a caller abandoning
    /// *its own* `exec` future (a `select!` timeout, a dropped future)
    /// can't strand every other waiter coalesced onto the same key.
    fn spawn_dispatch(&self, key: CacheKey, sql: Arc<str>, params: Vec<Value>, token: CancelToken) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let _token = token; // dropped at the end of this task, live until then
            let result = inner.upstream.exec_raw(sql, params).await;

            let waiters = {
                let mut entries = inner.entries.lock().expect("cache mutex poisoned");
                let Some(entry) = entries.get_mut(&key) else {
                    return;
                };
                entry.in_flight = None;
                match &result {
                    Ok(result) => {
                        entry.result = Some(result.clone());
                        entry.completed_at = Some(Instant::now());
                    }
                    Err(_) => {
                        entry.result = None;
                        entry.completed_at = None;
                    }
                }
                std::mem::take(&mut entry.waiters)
            };

            for (waiter, receiver) in waiters {
                if receiver.as_ref().map(WeakCancelToken::is_live).unwrap_or(true) {
                    let _ = waiter.send(clone_result(&result));
                }
            }
        });
    }

    /// Evicts every entry whose last completed result is older than
    /// `ttl`. Not required for correctness (a stale hit never happens:
    /// [`Cache::exec`] checks the age itself) but keeps long-lived caches
    /// over many distinct queries from growing without bound.
    pub fn evict_expired(&self) {
        let mut entries = self.0.entries.lock().expect("cache mutex poisoned");
        let ttl = self.0.ttl;
        let before = entries.len();
        entries.retain(|_, entry| match entry.completed_at {
            Some(at) => at.elapsed() < ttl,
            None => entry.in_flight.is_some(),
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "cache ttl eviction");
        }
    }

    /// Evicts the one entry matching `(sql, params)` outright, regardless
    /// of its age or whether a dispatch is still in flight for it.
    /// Returns whether an entry was actually present. The original's
    /// targeted single-key `clear`.
    pub fn clear(&self, sql: impl Into<Arc<str>>, params: Vec<Value>) -> bool {
        let key: CacheKey = (sql.into(), params);
        self.0.entries.lock().expect("cache mutex poisoned").remove(&key).is_some()
    }

    /// Evicts the one entry matching `(sql, params)` only if it has a
    /// completed result older than `max_age`; an entry still in flight
    /// (no result yet) is left alone. Returns whether it was evicted.
    pub fn expire(&self, max_age: Duration, sql: impl Into<Arc<str>>, params: Vec<Value>) -> bool {
        let key: CacheKey = (sql.into(), params);
        let mut entries = self.0.entries.lock().expect("cache mutex poisoned");
        let Some(entry) = entries.get(&key) else {
            return false;
        };
        let stale = match entry.completed_at {
            Some(at) => at.elapsed() >= max_age,
            None => false,
        };
        if stale {
            entries.remove(&key);
        }
        stale
    }

    /// Sweeps every entry with a completed result older than `max_age`,
    /// leaving in-flight entries untouched. Returns the number evicted —
    /// the original's `expireAll`.
    pub fn expire_all(&self, max_age: Duration) -> usize {
        let mut entries = self.0.entries.lock().expect("cache mutex poisoned");
        let before = entries.len();
        entries.retain(|_, entry| match entry.completed_at {
            Some(at) => at.elapsed() < max_age,
            None => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.0.entries.lock().expect("cache mutex poisoned").len()
    }

    /// Alias for [`Cache::len`].
    pub fn size(&self) -> usize {
        self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_fresh(entry: &CacheEntry, ttl: Duration) -> bool {
    entry.completed_at.map(|at| at.elapsed() < ttl).unwrap_or(false)
}

fn clone_result(result: &Result<PgResult>) -> Result<PgResult> {
    match result {
        Ok(result) => Ok(result.clone()),
        Err(err) => Err(Error::protocol(format!("upstream dispatch failed: {err}"))),
    }
}
