//! A connection pool for ldap connections, with idle-timeout reaping.
//!
//! Unlike a round-robin share of a fixed set of handles, this pool hands each
//! caller exclusive use of one connection: `get` checks a handle out, `release`
//! returns it. A background task wakes up periodically, probes every idle
//! connection with a Who Am I round trip and closes the ones that have sat
//! unused for more than the configured number of cycles, keeping a minimum
//! number alive.
//!
//! The pool is generic over [`Connector`] so its bookkeeping can be exercised
//! without a directory server; [`LdapConnector`] is the production
//! implementation.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ldap3::exop::WhoAmI;
use ldap3::{Ldap, LdapConnAsync};
use tokio::sync::watch;
use tokio::time;

use crate::config::{LdapConfig, PoolConfig};
use crate::error::{Result, ScanError};

/// Creates connections and restores their service identity.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Opens a fresh connection, bound with the pool's service credentials.
    async fn connect(&self) -> Result<Self::Conn>;

    /// Re-binds a connection with the service credentials, stripping any
    /// per-call bind a checkout performed.
    async fn service_bind(&self, conn: &mut Self::Conn) -> Result<()>;
}

/// A single pooled connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap local check whether the transport is already gone.
    fn is_closed(&mut self) -> bool;

    /// No-op round trip used by the reaper to detect silently dropped
    /// connections.
    async fn probe(&mut self) -> Result<()>;

    async fn close(&mut self);
}

/// Where and when a checked-out handle was acquired.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub id: u64,
    pub acquired: Instant,
}

struct IdleConn<T> {
    id: u64,
    conn: T,
    idle_cycles: u32,
}

/// In-use and idle handles. A handle id is in exactly one of the two maps at
/// any instant; the mutex in [`PoolInner`] guards both together.
struct ContextContainer<T> {
    in_use: HashMap<u64, Provenance>,
    idle: VecDeque<IdleConn<T>>,
}

impl<T> ContextContainer<T> {
    fn new() -> Self {
        Self {
            in_use: HashMap::new(),
            idle: VecDeque::new(),
        }
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    container: Mutex<ContextContainer<C::Conn>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    // explicit stop signal; dropping the sender stops the reaper too
    stop: watch::Sender<bool>,
}

/// An exclusively held pool connection. Return it with [`LdapPool::release`];
/// a handle that is simply dropped is logged as a leak and its connection is
/// torn down instead of being pooled.
pub struct PooledConn<C: Connector> {
    id: u64,
    acquired: Instant,
    conn: Option<C::Conn>,
    rebound: bool,
    pool: Weak<PoolInner<C>>,
}

impl<C: Connector> PooledConn<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks the connection as re-bound with caller credentials. On release
    /// the pool restores the service bind before pooling it again.
    pub fn mark_rebound(&mut self) {
        self.rebound = true;
    }
}

impl<C: Connector> Deref for PooledConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("connection present until release")
    }
}

impl<C: Connector> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("connection present until release")
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.container
                .lock()
                .expect("pool lock")
                .in_use
                .remove(&self.id);
            warn!(
                "connection {} dropped without release after {:?}, closing it",
                self.id,
                self.acquired.elapsed()
            );
        }
        // the transport shuts down once the last handle to it is gone
    }
}

pub struct LdapPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for LdapPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> LdapPool<C> {
    /// Creates the pool and starts its reaper task. Connections are opened
    /// lazily by [`get`](Self::get).
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(PoolInner {
            connector,
            config,
            container: Mutex::new(ContextContainer::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            stop: stop_tx,
        });

        spawn_reaper(&inner, stop_rx);

        Self { inner }
    }

    /// Checks a connection out, preferring the least recently touched idle
    /// handle and opening a new connection when none is idle. An idle handle
    /// found closed at checkout is discarded and replaced transparently.
    pub async fn get(&self) -> Result<PooledConn<C>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ScanError::PoolClosed);
        }

        let candidate = self
            .inner
            .container
            .lock()
            .expect("pool lock")
            .idle
            .pop_front();

        let reused = match candidate {
            Some(mut ic) => {
                if ic.conn.is_closed() {
                    warn!("connection {} was closed while idle, replacing it", ic.id);
                    ic.conn.close().await;
                    None
                } else {
                    Some((ic.id, ic.conn))
                }
            }
            None => None,
        };

        let (id, conn) = match reused {
            Some(pair) => pair,
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
                let conn = self.inner.connector.connect().await?;
                debug!("opened pool connection {id}");
                (id, conn)
            }
        };

        let acquired = Instant::now();
        self.inner
            .container
            .lock()
            .expect("pool lock")
            .in_use
            .insert(id, Provenance { id, acquired });

        Ok(PooledConn {
            id,
            acquired,
            conn: Some(conn),
            rebound: false,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Returns a connection to the idle set with its idle counter reset. A
    /// re-bound connection is first restored to the service identity, or
    /// closed if that fails. A handle this pool never handed out is an
    /// anomaly: it is logged and force-closed, never pooled.
    pub async fn release(&self, mut handle: PooledConn<C>) {
        let Some(mut conn) = handle.conn.take() else {
            return;
        };
        let id = handle.id;

        let tracked = self
            .inner
            .container
            .lock()
            .expect("pool lock")
            .in_use
            .remove(&id)
            .is_some();
        if !tracked {
            error!("released connection {id} was not checked out from this pool, closing it");
            conn.close().await;
            // hand the closed connection back so the drop bookkeeping of the
            // pool that actually issued the handle still runs
            handle.conn = Some(conn);
            return;
        }

        if handle.rebound {
            if let Err(e) = self.inner.connector.service_bind(&mut conn).await {
                debug!("could not restore service bind on connection {id}: {e}");
                conn.close().await;
                return;
            }
        }

        if self.inner.closed.load(Ordering::SeqCst) {
            conn.close().await;
            return;
        }

        self.inner
            .container
            .lock()
            .expect("pool lock")
            .idle
            .push_back(IdleConn {
                id,
                conn,
                idle_cycles: 0,
            });
    }

    /// Stops handing out connections and closes everything currently idle.
    /// Handles still checked out are closed by their eventual release.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        drop(self.inner.stop.send(true));
        self.inner.close_all_idle().await;
    }

    #[cfg(test)]
    async fn run_reap_cycle(&self) {
        self.inner.reap_cycle().await;
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let c = self.inner.container.lock().expect("pool lock");
        (c.in_use.len(), c.idle.len())
    }
}

impl<C: Connector> PoolInner<C> {
    /// One reaper pass: ages and probes every idle connection, closes dead
    /// ones, and closes expired ones down to the configured minimum. Also
    /// reports handles that have been checked out suspiciously long.
    async fn reap_cycle(&self) {
        let leak_after = Duration::from_secs(self.config.leak_warn_secs);
        let (candidates, long_held) = {
            let mut c = self.container.lock().expect("pool lock");
            let drained: Vec<IdleConn<C::Conn>> = c.idle.drain(..).collect();
            let held: Vec<Provenance> = c
                .in_use
                .values()
                .filter(|p| p.acquired.elapsed() >= leak_after)
                .cloned()
                .collect();
            (drained, held)
        };

        for p in long_held {
            warn!(
                "connection {} has been checked out for {:?}, possible leak",
                p.id,
                p.acquired.elapsed()
            );
        }

        let mut retained = candidates.len();
        let mut kept = Vec::with_capacity(candidates.len());
        for mut ic in candidates {
            ic.idle_cycles += 1;

            if let Err(e) = ic.conn.probe().await {
                info!("idle connection {} no longer answers ({e}), closing it", ic.id);
                ic.conn.close().await;
                retained -= 1;
                continue;
            }

            if ic.idle_cycles > self.config.keepalive_cycles && retained > self.config.min_idle {
                debug!(
                    "closing connection {} after {} idle cycles",
                    ic.id, ic.idle_cycles
                );
                ic.conn.close().await;
                retained -= 1;
                continue;
            }

            kept.push(ic);
        }

        // re-insert ahead of anything released meanwhile, oldest first
        let mut c = self.container.lock().expect("pool lock");
        for ic in kept.into_iter().rev() {
            c.idle.push_front(ic);
        }
    }

    async fn close_all_idle(&self) {
        let drained: Vec<IdleConn<C::Conn>> = {
            let mut c = self.container.lock().expect("pool lock");
            c.idle.drain(..).collect()
        };
        for mut ic in drained {
            ic.conn.close().await;
        }
    }
}

fn spawn_reaper<C: Connector>(inner: &Arc<PoolInner<C>>, mut stop: watch::Receiver<bool>) {
    let interval = Duration::from_secs(inner.config.reap_interval_secs);
    let weak = Arc::downgrade(inner);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            let Some(pool) = weak.upgrade() else {
                return;
            };
            pool.reap_cycle().await;
        }
        // stop signal: reclamation ends, currently-idle handles are closed
        if let Some(pool) = weak.upgrade() {
            pool.close_all_idle().await;
        }
    });
}

/// Production connector driving ldap3.
pub struct LdapConnector {
    server: String,
    bind: Option<(String, String)>,
}

impl LdapConnector {
    pub fn new(config: &LdapConfig) -> Self {
        Self {
            server: config.server().to_owned(),
            bind: config.bind(),
        }
    }
}

#[async_trait]
impl Connector for LdapConnector {
    type Conn = LdapConnection;

    async fn connect(&self) -> Result<LdapConnection> {
        let (conn, mut ldap) = LdapConnAsync::new(self.server.as_str()).await?;
        ldap3::drive!(conn);

        if let Some((ref dn, ref password)) = self.bind {
            ldap.simple_bind(dn, password).await?.success()?;
        }

        Ok(LdapConnection { ldap })
    }

    async fn service_bind(&self, conn: &mut LdapConnection) -> Result<()> {
        let Some((ref dn, ref password)) = self.bind else {
            // an anonymous pool has no identity to restore
            return Err(ScanError::Config(
                "no service credentials configured".to_owned(),
            ));
        };
        conn.ldap.simple_bind(dn, password).await?.success()?;
        Ok(())
    }
}

pub struct LdapConnection {
    ldap: Ldap,
}

impl LdapConnection {
    pub fn ldap(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

#[async_trait]
impl Connection for LdapConnection {
    fn is_closed(&mut self) -> bool {
        self.ldap.is_closed()
    }

    async fn probe(&mut self) -> Result<()> {
        self.ldap.extended(WhoAmI).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ldap.unbind().await {
            debug!("unbind failed: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct MockState {
        created: AtomicUsize,
        closed: AtomicUsize,
        service_binds: AtomicUsize,
        probes_fail: AtomicBool,
        idle_looks_closed: AtomicBool,
        service_bind_fails: AtomicBool,
    }

    struct MockConnector {
        state: Arc<MockState>,
    }

    struct MockConn {
        state: Arc<MockState>,
        closed: bool,
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Conn = MockConn;

        async fn connect(&self) -> Result<MockConn> {
            self.state.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn {
                state: Arc::clone(&self.state),
                closed: false,
            })
        }

        async fn service_bind(&self, _conn: &mut MockConn) -> Result<()> {
            if self.state.service_bind_fails.load(Ordering::SeqCst) {
                return Err(ScanError::Config("bind refused".to_owned()));
            }
            self.state.service_binds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Connection for MockConn {
        fn is_closed(&mut self) -> bool {
            self.closed || self.state.idle_looks_closed.load(Ordering::SeqCst)
        }

        async fn probe(&mut self) -> Result<()> {
            if self.state.probes_fail.load(Ordering::SeqCst) {
                return Err(ScanError::Config("probe failed".to_owned()));
            }
            Ok(())
        }

        async fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.state.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn test_pool(min_idle: usize, keepalive: u32) -> (LdapPool<MockConnector>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let config = PoolConfig {
            min_idle,
            keepalive_cycles: keepalive,
            // long enough that the background task never interferes
            reap_interval_secs: 3600,
            leak_warn_secs: 3600,
        };
        let pool = LdapPool::new(
            MockConnector {
                state: Arc::clone(&state),
            },
            config,
        );
        (pool, state)
    }

    #[tokio::test]
    async fn handle_is_in_exactly_one_set() {
        let (pool, state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.counts(), (1, 0));

        pool.release(conn).await;
        assert_eq!(pool.counts(), (0, 1));

        // checkout again reuses the idle handle instead of connecting
        let conn = pool.get().await.unwrap();
        assert_eq!(pool.counts(), (1, 0));
        assert_eq!(state.created.load(Ordering::SeqCst), 1);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn least_recently_touched_idle_is_preferred() {
        let (pool, _state) = test_pool(0, 2);

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        let first_back = a.id();
        pool.release(a).await;
        pool.release(b).await;

        let next = pool.get().await.unwrap();
        assert_eq!(next.id(), first_back);
        pool.release(next).await;
    }

    #[tokio::test]
    async fn reaper_closes_expired_idle_beyond_minimum() {
        let (pool, state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;

        // within the keep-alive threshold the handle survives
        pool.run_reap_cycle().await;
        pool.run_reap_cycle().await;
        assert_eq!(pool.counts(), (0, 1));

        // keepalive + 1 cycles without a get close it
        pool.run_reap_cycle().await;
        assert_eq!(pool.counts(), (0, 0));
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn minimum_idle_count_is_retained() {
        let (pool, state) = test_pool(1, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;

        for _ in 0..5 {
            pool.run_reap_cycle().await;
        }
        assert_eq!(pool.counts(), (0, 1));
        assert_eq!(state.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn checkout_resets_idle_counter() {
        let (pool, state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;
        pool.run_reap_cycle().await;
        pool.run_reap_cycle().await;

        // touch the handle; its counter starts over
        let conn = pool.get().await.unwrap();
        pool.release(conn).await;
        pool.run_reap_cycle().await;
        pool.run_reap_cycle().await;
        assert_eq!(pool.counts(), (0, 1));

        pool.run_reap_cycle().await;
        assert_eq!(pool.counts(), (0, 0));
        assert_eq!(state.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_idle_connection_is_closed_regardless_of_minimum() {
        let (pool, state) = test_pool(1, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;

        state.probes_fail.store(true, Ordering::SeqCst);
        pool.run_reap_cycle().await;
        assert_eq!(pool.counts(), (0, 0));
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_handle_at_checkout_is_replaced() {
        let (pool, state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;

        state.idle_looks_closed.store(true, Ordering::SeqCst);
        let conn = pool.get().await.unwrap();
        state.idle_looks_closed.store(false, Ordering::SeqCst);

        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.counts(), (1, 0));
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn foreign_handle_release_closes_it_and_keeps_state_consistent() {
        let (pool_a, _state_a) = test_pool(0, 2);
        let (pool_b, state_b) = test_pool(0, 2);

        let stray = pool_b.get().await.unwrap();
        pool_a.release(stray).await;

        // never pooled by the wrong pool, and closed
        assert_eq!(pool_a.counts(), (0, 0));
        assert_eq!(state_b.closed.load(Ordering::SeqCst), 1);

        // the issuing pool no longer tracks the handle as checked out, so it
        // will not keep reporting it as leaked
        assert_eq!(pool_b.counts(), (0, 0));

        // pool_a still works normally afterwards
        let conn = pool_a.get().await.unwrap();
        assert_eq!(pool_a.counts(), (1, 0));
        pool_a.release(conn).await;
        assert_eq!(pool_a.counts(), (0, 1));
    }

    #[tokio::test]
    async fn rebound_connection_is_restored_on_release() {
        let (pool, state) = test_pool(0, 2);

        let mut conn = pool.get().await.unwrap();
        conn.mark_rebound();
        pool.release(conn).await;

        assert_eq!(state.service_binds.load(Ordering::SeqCst), 1);
        assert_eq!(pool.counts(), (0, 1));
    }

    #[tokio::test]
    async fn rebound_connection_is_closed_when_restore_fails() {
        let (pool, state) = test_pool(0, 2);

        let mut conn = pool.get().await.unwrap();
        conn.mark_rebound();
        state.service_bind_fails.store(true, Ordering::SeqCst);
        pool.release(conn).await;

        assert_eq!(pool.counts(), (0, 0));
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_handle_is_untracked() {
        let (pool, _state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        assert_eq!(pool.counts(), (1, 0));
        drop(conn);
        assert_eq!(pool.counts(), (0, 0));
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_checkouts() {
        let (pool, state) = test_pool(0, 2);

        let conn = pool.get().await.unwrap();
        pool.release(conn).await;

        pool.shutdown().await;
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.get().await, Err(ScanError::PoolClosed)));
    }
}
