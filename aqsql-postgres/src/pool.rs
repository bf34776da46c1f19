//! Connection pool: lending, idle reuse, waiter queuing.
//!
//! Grounded on the original library's `APool` static API (`database`,
//! `setMaxConnections`, a process-wide registry keyed by pool name) and,
//! for the lend/return bookkeeping itself, on the shape the other
//! examples converge on for connection pools: an idle stack, a strict
//! FIFO of waiters, and a guard object whose `Drop` returns the borrowed
//! connection rather than requiring the caller to remember to.

use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};

use futures_core::future::BoxFuture;
use tokio::sync::oneshot;

use aqsql_core::{Error, Result};

use crate::cache::Executor;
use crate::result::PgResult;
use crate::value::Value;

/// What a [`Pool`] can lend out. `Database` is the only real
/// implementation; the trait exists so pool bookkeeping (idle stack,
/// waiter FIFO, caps) can be exercised in tests against a lightweight
/// fake with no socket involved.
pub trait PoolableHandle: Clone + Send + Sync + 'static {
    fn is_healthy(&self) -> bool;
}

/// `spec.md`'s driver factory: the abstract capability to produce a new
/// handle on demand, parameterized over what it produces so the same
/// trait covers both the real `Database::connect` and test doubles.
pub trait ConnectFactory<H>: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<H>>;
}

/// A function-pointer/closure factory, for the common case of wrapping
/// an existing async constructor without a dedicated type.
impl<H, F, Fut> ConnectFactory<H> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<H>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'static, Result<H>> {
        Box::pin((self)())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// `None` means unbounded.
    pub max_connections: Option<usize>,
    pub max_idle_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: Some(10),
            max_idle_connections: 10,
        }
    }
}

type SetupCallback<H> = Arc<dyn Fn(H) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Waiter<H> {
    respond: oneshot::Sender<H>,
}

struct PoolState<H> {
    idle: VecDeque<H>,
    current_connections: usize,
    waiters: VecDeque<Waiter<H>>,
    config: PoolConfig,
    setup_cb: Option<SetupCallback<H>>,
    reuse_cb: Option<SetupCallback<H>>,
}

struct PoolInner<H> {
    factory: Arc<dyn ConnectFactory<H>>,
    state: Mutex<PoolState<H>>,
}

/// A bounded set of pooled handles, lent out via [`Lease`] guards that
/// return the handle to the idle stack (or drop it, past the idle cap)
/// when the lease itself drops.
pub struct Pool<H: PoolableHandle = crate::Database> {
    inner: Arc<PoolInner<H>>,
}

impl<H: PoolableHandle> Clone for Pool<H> {
    fn clone(&self) -> Self {
        Pool { inner: self.inner.clone() }
    }
}

impl<H: PoolableHandle> Pool<H> {
    pub fn new(factory: impl ConnectFactory<H>, config: PoolConfig) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                factory: Arc::new(factory),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    current_connections: 0,
                    waiters: VecDeque::new(),
                    config,
                    setup_cb: None,
                    reuse_cb: None,
                }),
            }),
        }
    }

    pub fn set_max_connections(&self, max: Option<usize>) {
        self.inner.state.lock().expect("pool mutex poisoned").config.max_connections = max;
    }

    pub fn set_max_idle_connections(&self, max: usize) {
        self.inner.state.lock().expect("pool mutex poisoned").config.max_idle_connections = max;
    }

    pub fn set_setup_callback<F, Fut>(&self, cb: F)
    where
        F: Fn(H) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.state.lock().expect("pool mutex poisoned").setup_cb = Some(Arc::new(move |h| Box::pin(cb(h))));
    }

    pub fn set_reuse_callback<F, Fut>(&self, cb: F)
    where
        F: Fn(H) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.state.lock().expect("pool mutex poisoned").reuse_cb = Some(Arc::new(move |h| Box::pin(cb(h))));
    }

    pub fn current_connections(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").current_connections
    }

    /// Synchronous lend: returns an idle handle, opens a fresh one if
    /// under cap, or `PoolExhausted` if bounded and at cap with nothing
    /// idle. Never waits.
    pub async fn database(&self) -> Result<Lease<H>> {
        let action = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            self.try_take_idle_or_reserve(&mut state)
        };

        match action {
            TakeAction::Idle(handle) => {
                tracing::debug!("lending idle connection");
                self.run_reuse_callback(&handle).await?;
                Ok(Lease::new(self.clone(), handle))
            }
            TakeAction::Reserved => match self.open_and_setup().await {
                Ok(handle) => {
                    tracing::debug!("lending freshly opened connection");
                    Ok(Lease::new(self.clone(), handle))
                }
                Err(err) => {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.current_connections -= 1;
                    Err(err)
                }
            },
            TakeAction::Exhausted => {
                tracing::debug!("pool exhausted");
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Asynchronous lend: guarantees a handle by enqueuing a waiter (FIFO
    /// among live waiters) if the pool is at cap with nothing idle.
    pub async fn database_async(&self) -> Result<Lease<H>> {
        let action = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            self.try_take_idle_or_reserve(&mut state)
        };

        match action {
            TakeAction::Idle(handle) => {
                tracing::debug!("lending idle connection");
                self.run_reuse_callback(&handle).await?;
                Ok(Lease::new(self.clone(), handle))
            }
            TakeAction::Reserved => match self.open_and_setup().await {
                Ok(handle) => {
                    tracing::debug!("lending freshly opened connection");
                    Ok(Lease::new(self.clone(), handle))
                }
                Err(err) => {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.current_connections -= 1;
                    Err(err)
                }
            },
            TakeAction::Exhausted => {
                tracing::debug!("pool at cap, queuing waiter");
                let (tx, rx) = oneshot::channel();
                {
                    let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                    state.waiters.push_back(Waiter { respond: tx });
                }
                let handle = rx.await.map_err(|_| Error::WorkerCrashed)?;
                tracing::debug!("waiter served a connection");
                Ok(Lease::new(self.clone(), handle))
            }
        }
    }

    fn try_take_idle_or_reserve(&self, state: &mut PoolState<H>) -> TakeAction<H> {
        if let Some(handle) = state.idle.pop_back() {
            return TakeAction::Idle(handle);
        }
        let at_cap = state.config.max_connections.map(|max| state.current_connections >= max).unwrap_or(false);
        if at_cap {
            return TakeAction::Exhausted;
        }
        state.current_connections += 1;
        TakeAction::Reserved
    }

    async fn open_and_setup(&self) -> Result<H> {
        let handle = self.inner.factory.connect().await?;
        let setup_cb = self.inner.state.lock().expect("pool mutex poisoned").setup_cb.clone();
        if let Some(cb) = setup_cb {
            cb(handle.clone()).await?;
        }
        Ok(handle)
    }

    async fn run_reuse_callback(&self, handle: &H) -> Result<()> {
        let reuse_cb = self.inner.state.lock().expect("pool mutex poisoned").reuse_cb.clone();
        if let Some(cb) = reuse_cb {
            cb(handle.clone()).await?;
        }
        Ok(())
    }

    /// Returns a handle to the pool: served to the next live waiter if
    /// any, else pushed onto the idle stack (dropped outright past the
    /// idle cap, and its slot released). Dead handles are always
    /// dropped and their slot released rather than recycled.
    fn release(&self, handle: H) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");

        if !handle.is_healthy() {
            tracing::debug!("released connection unhealthy, dropping slot");
            state.current_connections -= 1;
            return;
        }

        let mut handle = handle;
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.respond.is_closed() {
                // the waiting future was dropped; skip it, the caller no
                // longer wants this connection.
                continue;
            }
            match waiter.respond.send(handle) {
                Ok(()) => {
                    tracing::debug!("returned connection handed to a waiter");
                    return;
                }
                Err(returned) => handle = returned, // closed between the check and the send
            }
        }

        if state.idle.len() < state.config.max_idle_connections {
            tracing::debug!("returned connection pushed onto idle stack");
            state.idle.push_back(handle);
        } else {
            tracing::debug!("idle cap reached, dropping returned connection's slot");
            state.current_connections -= 1;
        }
    }
}

impl<H: PoolableHandle> Executor for Pool<H>
where
    H: Executor,
{
    fn exec_raw(&self, sql: Arc<str>, params: Vec<Value>) -> BoxFuture<'static, Result<PgResult>> {
        let pool = self.clone();
        Box::pin(async move {
            let lease = pool.database_async().await?;
            lease.exec_raw(sql, params).await
        })
    }
}

enum TakeAction<H> {
    Idle(H),
    Reserved,
    Exhausted,
}

/// A borrowed handle. Returns itself to the pool it came from when
/// dropped, the same way the original `TransactionManager`'s implicit
/// rollback guard works — the caller never has to remember to call
/// anything to give the connection back.
pub struct Lease<H: PoolableHandle> {
    pool: Pool<H>,
    handle: Option<H>,
}

impl<H: PoolableHandle> Lease<H> {
    fn new(pool: Pool<H>, handle: H) -> Self {
        Lease { pool, handle: Some(handle) }
    }
}

impl<H: PoolableHandle> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.handle.as_ref().expect("handle taken only on drop")
    }
}

impl<H: PoolableHandle> Drop for Lease<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

/// The process-wide named registry `spec.md`'s `Pool::create`/`remove`/
/// `get(name)` trio implies: pools are looked up by name from anywhere
/// in the program, not threaded through explicitly.
static REGISTRY: OnceLock<Mutex<HashMap<String, Pool<crate::Database>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Pool<crate::Database>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl Pool<crate::Database> {
    /// Registers a new named pool backed by `options`, replacing any
    /// pool already registered under `name`.
    pub fn create(name: impl Into<String>, options: aqsql_core::ConnectOptions, config: PoolConfig) -> Self {
        let factory = move || {
            let options = options.clone();
            async move { crate::Database::connect(&options).await }
        };
        let pool = Pool::new(factory, config);
        registry().lock().expect("pool registry poisoned").insert(name.into(), pool.clone());
        pool
    }

    pub fn remove(name: &str) -> Option<Self> {
        registry().lock().expect("pool registry poisoned").remove(name)
    }

    pub fn get(name: &str) -> Result<Self> {
        registry()
            .lock()
            .expect("pool registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(name.to_owned()))
    }

    pub fn names() -> Vec<String> {
        registry().lock().expect("pool registry poisoned").keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone)]
    struct FakeHandle {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    impl PoolableHandle for FakeHandle {
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn counting_factory() -> (impl ConnectFactory<FakeHandle>, Arc<AtomicUsize>) {
        let next_id = Arc::new(AtomicUsize::new(0));
        let counter = next_id.clone();
        let factory = move || {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            async move { Ok(FakeHandle { id, healthy: Arc::new(AtomicBool::new(true)) }) }
        };
        (factory, counter)
    }

    #[tokio::test]
    async fn opens_fresh_handles_up_to_cap() {
        let (factory, opened) = counting_factory();
        let pool = Pool::new(factory, PoolConfig { max_connections: Some(2), max_idle_connections: 2 });

        let a = pool.database().await.unwrap();
        let b = pool.database().await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.current_connections(), 2);

        let exhausted = pool.database().await;
        assert!(matches!(exhausted, Err(Error::PoolExhausted)));

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn released_handle_is_reused_not_reopened() {
        let (factory, opened) = counting_factory();
        let pool = Pool::new(factory, PoolConfig { max_connections: Some(1), max_idle_connections: 1 });

        let lease = pool.database().await.unwrap();
        let id = lease.id;
        drop(lease);

        let lease = pool.database().await.unwrap();
        assert_eq!(lease.id, id);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let (factory, _opened) = counting_factory();
        let pool = Pool::new(factory, PoolConfig { max_connections: Some(1), max_idle_connections: 1 });

        let first = pool.database_async().await.unwrap();

        let pool_a = pool.clone();
        let waiter_a = tokio::spawn(async move { pool_a.database_async().await.unwrap() });
        tokio::task::yield_now().await;
        let pool_b = pool.clone();
        let waiter_b = tokio::spawn(async move { pool_b.database_async().await.unwrap() });
        tokio::task::yield_now().await;

        drop(first);

        // Only the first waiter should have been unblocked; the second is
        // still queued behind it until that lease drops in turn.
        let lease_a = waiter_a.await.unwrap();
        tokio::task::yield_now().await;
        assert!(!waiter_b.is_finished());

        // Dropping the lease returned to waiter_a wakes waiter_b.
        drop(lease_a);
        let _ = waiter_b.await.unwrap();
    }

    #[tokio::test]
    async fn unhealthy_release_drops_the_slot() {
        let (factory, _opened) = counting_factory();
        let pool = Pool::new(factory, PoolConfig { max_connections: Some(1), max_idle_connections: 1 });

        let lease = pool.database().await.unwrap();
        lease.healthy.store(false, Ordering::SeqCst);
        drop(lease);

        assert_eq!(pool.current_connections(), 0);
    }
}
