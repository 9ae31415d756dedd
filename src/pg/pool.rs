//! PostgreSQL connection pool.
//!
//! All pool bookkeeping lives in one worker task: the live connection set,
//! idle connections and the FIFO of waiting `acquire` calls. Acquire,
//! release, connect results and connection-loss events are messages to that
//! task, so two concurrent acquires can never both claim the last slot.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use super::command::QueryResult;
use super::config::{duration_secs, PgConfig};
use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::transaction::Transaction;
use super::types::PgValue;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgPoolConfig {
    /// Settings for every connection the pool opens
    pub connection: PgConfig,
    /// Connections opened by [`PgPool::connect`] before it returns
    pub min_connections: u32,
    /// Maximum number of live connections
    pub max_connections: u32,
    /// Give up on `acquire` after this long (`None` waits indefinitely)
    #[serde(with = "optional_duration_secs")]
    pub acquire_timeout: Option<Duration>,
    /// First delay before retrying a failed connect
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,
    /// Upper bound for the doubling retry delay
    #[serde(with = "duration_secs")]
    pub max_reconnect_backoff: Duration,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self::new(PgConfig::default())
    }
}

impl PgPoolConfig {
    /// Create a new pool configuration.
    pub fn new(connection: PgConfig) -> Self {
        Self {
            connection,
            min_connections: 0,
            max_connections: 10,
            acquire_timeout: None,
            reconnect_backoff: Duration::from_millis(50),
            max_reconnect_backoff: Duration::from_secs(2),
        }
    }

    /// Parse the connection settings from a URL.
    pub fn from_url(url: &str) -> PgResult<Self> {
        Ok(Self::new(PgConfig::from_url(url)?))
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff = initial;
        self.max_reconnect_backoff = max.max(initial);
        self
    }

    fn validate(&self) -> PgResult<()> {
        self.connection.validate()?;
        if self.max_connections == 0 {
            return Err(PgError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}

mod optional_duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Snapshot of the pool's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live connections, idle or handed out
    pub size: usize,
    pub idle: usize,
    /// Connect attempts in progress
    pub connecting: usize,
    /// `acquire` calls waiting for a connection
    pub waiters: usize,
    pub max_connections: usize,
    pub closed: bool,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection {
    conn: PgConnection,
    pool: PgPool,
}

impl PooledConnection {
    pub fn connection(&self) -> &PgConnection {
        &self.conn
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        !self.conn.is_closed()
    }
}

impl Deref for PooledConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone());
    }
}

/// A transaction on a pooled connection.
///
/// The connection goes back to the pool once the transaction ends. Dropping
/// it un-ended queues a rollback and retires the connection instead.
pub struct PoolTransaction {
    // Drop order: the rollback is queued before the release
    tx: Transaction,
    conn: PooledConnection,
}

impl PoolTransaction {
    pub fn connection(&self) -> &PgConnection {
        &self.conn
    }

    pub fn query(
        &self,
        sql: &str,
        params: &[PgValue],
    ) -> impl Future<Output = PgResult<QueryResult>> + Send + 'static {
        self.tx.query(sql, params)
    }

    pub fn simple_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = PgResult<Vec<QueryResult>>> + Send + 'static {
        self.tx.simple_query(sql)
    }

    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        self.tx.execute(sql, params).await
    }

    pub async fn commit(self) -> PgResult<()> {
        let PoolTransaction { tx, conn } = self;
        let result = tx.commit().await;
        drop(conn);
        result
    }

    pub async fn rollback(self) -> PgResult<()> {
        let PoolTransaction { tx, conn } = self;
        let result = tx.rollback().await;
        drop(conn);
        result
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

struct PgPoolInner {
    config: PgPoolConfig,
    worker: mpsc::UnboundedSender<PoolMessage>,
}

/// A PostgreSQL connection pool.
///
/// Connections are opened on demand up to `max_connections` and replaced
/// when they fail. Waiting `acquire` calls are served in arrival order.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a pool without opening any connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PgPoolConfig) -> PgResult<Self> {
        config.validate()?;
        let (send, recv) = mpsc::unbounded_channel();
        let worker = PoolWorker {
            config: config.clone(),
            recv,
            send: send.downgrade(),
            live: HashSet::new(),
            connecting: 0,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            backoff: config.reconnect_backoff,
            retry_scheduled: false,
            closed: false,
        };
        tokio::spawn(worker.run());

        Ok(Self {
            inner: Arc::new(PgPoolInner {
                config,
                worker: send,
            }),
        })
    }

    /// Create a pool and open `min_connections` connections.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        let min = config.min_connections as usize;
        let pool = Self::new(config)?;

        let mut warm = Vec::with_capacity(min);
        for _ in 0..min {
            warm.push(pool.acquire().await?);
        }
        drop(warm);
        Ok(pool)
    }

    /// Get a connection from the pool.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        let (send, recv) = oneshot::channel();
        self.inner
            .worker
            .send(PoolMessage::Acquire(send))
            .map_err(|_| PgError::PoolClosed)?;

        let result = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, recv)
                .await
                .map_err(|_| PgError::Timeout)?,
            None => recv.await,
        };
        let conn = result.map_err(|_| PgError::PoolClosed)??;

        Ok(PooledConnection {
            conn,
            pool: self.clone(),
        })
    }

    fn release(&self, conn: PgConnection) {
        if let Err(mpsc::error::SendError(PoolMessage::Release(conn))) =
            self.inner.worker.send(PoolMessage::Release(conn))
        {
            tokio::spawn(async move {
                let _ = conn.close().await;
            });
        }
    }

    /// Execute a simple query on a pooled connection.
    pub async fn simple_query(&self, query: &str) -> PgResult<Vec<QueryResult>> {
        let conn = self.acquire().await?;
        conn.simple_query(query).await
    }

    /// Execute a parameterized query on a pooled connection.
    pub async fn query(&self, query: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let conn = self.acquire().await?;
        conn.query(query, params).await
    }

    /// Execute a query without returning results (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, query: &str, params: &[PgValue]) -> PgResult<u64> {
        let conn = self.acquire().await?;
        conn.execute(query, params).await
    }

    /// Begin a transaction on a pooled connection.
    pub async fn begin(&self) -> PgResult<PoolTransaction> {
        let conn = self.acquire().await?;
        let tx = conn.begin()?;
        Ok(PoolTransaction { tx, conn })
    }

    /// Run `f` with a pooled connection and release it afterwards, whether
    /// `f` succeeded or not.
    ///
    /// `f` receives a handle clone; it must not keep it past its future.
    pub async fn with_connection<F, Fut, T>(&self, f: F) -> PgResult<T>
    where
        F: FnOnce(PgConnection) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let conn = self.acquire().await?;
        f(conn.connection().clone()).await
    }

    /// Run `f` inside a transaction: commit when it returns `Ok`, roll back
    /// when it returns `Err`. The connection is released either way.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> PgResult<T>
    where
        F: FnOnce(PgConnection) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let tx = self.begin().await?;
        match f(tx.connection().clone()).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    log::warn!("rollback after failed transaction body: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    /// Close the pool.
    ///
    /// Waiting `acquire` calls fail with [`PgError::PoolClosed`], idle
    /// connections are closed, and connections still checked out are closed
    /// when released.
    pub async fn close(&self) {
        let (send, recv) = oneshot::channel();
        if self.inner.worker.send(PoolMessage::Close(send)).is_ok() {
            let _ = recv.await;
        }
    }

    pub async fn status(&self) -> PgResult<PoolStatus> {
        let (send, recv) = oneshot::channel();
        self.inner
            .worker
            .send(PoolMessage::Status(send))
            .map_err(|_| PgError::PoolClosed)?;
        recv.await.map_err(|_| PgError::PoolClosed)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }
}

// ============================================================================
// Pool worker
// ============================================================================

type AcquireSend = oneshot::Sender<PgResult<PgConnection>>;

enum PoolMessage {
    Acquire(AcquireSend),
    Release(PgConnection),
    Connected(PgResult<PgConnection>),
    /// A live connection closed, for whatever reason
    Closed(u64),
    RetryConnect,
    Status(oneshot::Sender<PoolStatus>),
    Close(oneshot::Sender<()>),
}

struct PoolWorker {
    config: PgPoolConfig,
    recv: mpsc::UnboundedReceiver<PoolMessage>,
    /// Weak so that connect tasks and close hooks do not keep the pool alive
    send: mpsc::WeakUnboundedSender<PoolMessage>,
    live: HashSet<u64>,
    connecting: usize,
    idle: VecDeque<PgConnection>,
    waiters: VecDeque<AcquireSend>,
    backoff: Duration,
    retry_scheduled: bool,
    closed: bool,
}

impl PoolWorker {
    async fn run(mut self) {
        while let Some(msg) = self.recv.recv().await {
            match msg {
                PoolMessage::Acquire(send) => self.acquire(send),
                PoolMessage::Release(conn) => self.release(conn),
                PoolMessage::Connected(result) => self.connected(result),
                PoolMessage::Closed(id) => {
                    if self.live.remove(&id) {
                        log::debug!("pool: connection {} closed", id);
                    }
                    self.idle.retain(|c| c.id() != id);
                    self.spawn_connects();
                }
                PoolMessage::RetryConnect => {
                    self.retry_scheduled = false;
                    self.spawn_connects();
                }
                PoolMessage::Status(send) => {
                    let _ = send.send(self.status());
                }
                PoolMessage::Close(send) => {
                    self.close();
                    let _ = send.send(());
                }
            }
            self.trace("after message");
        }

        // Every pool handle is gone
        self.close();
    }

    fn acquire(&mut self, send: AcquireSend) {
        if self.closed {
            let _ = send.send(Err(PgError::PoolClosed));
            return;
        }
        while let Some(conn) = self.idle.pop_front() {
            if conn.is_closed() {
                // Its slot is freed by the close hook
                continue;
            }
            match send.send(Ok(conn)) {
                Ok(()) => return,
                // Caller gave up while the message was queued
                Err(Ok(conn)) => {
                    self.idle.push_front(conn);
                    return;
                }
                Err(Err(_)) => return,
            }
        }
        self.waiters.push_back(send);
        self.spawn_connects();
    }

    fn release(&mut self, conn: PgConnection) {
        if conn.is_closed() {
            // Still counted until its close hook reports the socket gone
            return;
        }
        if !self.live.contains(&conn.id()) {
            return;
        }
        if self.closed || conn.in_transaction() {
            // A transaction still open here belongs to a handle we cannot see
            self.discard(conn);
            return;
        }
        self.hand_out(conn);
    }

    fn connected(&mut self, result: PgResult<PgConnection>) {
        self.connecting = self.connecting.saturating_sub(1);
        match result {
            Ok(conn) => {
                let id = conn.id();
                if self.closed {
                    self.discard(conn);
                    return;
                }
                log::debug!("pool: opened connection {}", id);
                self.backoff = self.config.reconnect_backoff;
                self.live.insert(id);

                let notify = self.send.clone();
                conn.add_close_hook(move || {
                    if let Some(send) = notify.upgrade() {
                        let _ = send.send(PoolMessage::Closed(id));
                    }
                });
                self.hand_out(conn);
            }
            Err(err) => {
                log::warn!("pool: connect failed: {}", err);
                // The oldest waiter gets the error so nobody waits forever
                while let Some(waiter) = self.waiters.pop_front() {
                    if waiter.send(Err(err.clone())).is_ok() {
                        break;
                    }
                }
                if !self.waiters.is_empty() {
                    self.schedule_retry();
                }
            }
        }
    }

    /// Give `conn` to the oldest waiter still listening, or park it idle.
    fn hand_out(&mut self, mut conn: PgConnection) {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(Ok(conn)) {
                Ok(()) => return,
                Err(Ok(back)) => conn = back,
                Err(Err(_)) => return,
            }
        }
        self.idle.push_back(conn);
    }

    /// Open connections for waiters that no idle or connecting one covers.
    fn spawn_connects(&mut self) {
        if self.closed || self.retry_scheduled {
            return;
        }
        self.waiters.retain(|w| !w.is_closed());
        let max = self.config.max_connections as usize;
        while self.waiters.len() > self.connecting && self.live.len() + self.connecting < max {
            self.connecting += 1;
            let config = self.config.connection.clone();
            let send = self.send.clone();
            tokio::spawn(async move {
                let result = PgConnection::connect_with_config(config).await;
                match send.upgrade() {
                    Some(send) => {
                        let _ = send.send(PoolMessage::Connected(result));
                    }
                    None => {
                        if let Ok(conn) = result {
                            let _ = conn.close().await;
                        }
                    }
                }
            });
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(self.config.max_reconnect_backoff);
        log::debug!("pool: retrying connect in {:?}", delay);

        let send = self.send.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(send) = send.upgrade() {
                let _ = send.send(PoolMessage::RetryConnect);
            }
        });
    }

    /// Close `conn`. It keeps its slot in `live` until the close hook runs.
    fn discard(&mut self, conn: PgConnection) {
        tokio::spawn(async move {
            let _ = conn.close().await;
        });
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        log::debug!("pool: closing");
        self.closed = true;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(PgError::PoolClosed));
        }
        let idle: Vec<_> = self.idle.drain(..).collect();
        for conn in idle {
            self.discard(conn);
        }
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.live.len(),
            idle: self.idle.len(),
            connecting: self.connecting,
            waiters: self.waiters.len(),
            max_connections: self.config.max_connections as usize,
            closed: self.closed,
        }
    }

    fn trace(&self, what: &str) {
        log::trace!(
            "pool {}: live={}, idle={}, connecting={}, waiters={}",
            what,
            self.live.len(),
            self.idle.len(),
            self.connecting,
            self.waiters.len()
        );
    }
}
