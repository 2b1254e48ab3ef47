//! Role-scoped connection pool
//!
//! Each role (privileged, read-only) has its own permit semaphore and idle
//! queue. Connections are validated before reuse, broken ones are replaced,
//! and a maintenance task keeps at least `min_connections` alive per role.
//!
//! ```rust,ignore
//! let pool = Pool::new(factory, PoolConfig::default().with_max_connections(8)).await;
//! let conn = pool.acquire(Role::ReadOnly).await?;
//! conn.query("SELECT 1", &[]).await?;
//! // returned to the pool when dropped
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendResult, Connection, ConnectionFactory, Role};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept alive per role
    pub min_connections: usize,
    /// Upper bound on borrowed connections per role
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 16,
            acquire_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

/// Point-in-time pool counters, summed over both roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub live: usize,
    pub created: u64,
    pub replaced: u64,
    pub timeouts: u64,
}

struct Slot {
    role: Role,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    live: AtomicUsize,
}

impl Slot {
    fn new(role: Role, max: usize) -> Self {
        Self {
            role,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::with_capacity(max)),
            live: AtomicUsize::new(0),
        }
    }
}

struct Shared {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    privileged: Slot,
    read_only: Slot,
    created: AtomicU64,
    replaced: AtomicU64,
    timeouts: AtomicU64,
    shutdown: CancellationToken,
}

impl Shared {
    fn slot(&self, role: Role) -> &Slot {
        match role {
            Role::Privileged => &self.privileged,
            Role::ReadOnly => &self.read_only,
        }
    }

    async fn open(&self, slot: &Slot) -> BackendResult<Box<dyn Connection>> {
        let conn = self.factory.connect(slot.role).await?;
        slot.live.fetch_add(1, Ordering::AcqRel);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    fn discard(&self, slot: &Slot) {
        slot.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Opens connections until `min_connections` are live.
    async fn top_up(&self, slot: &Slot) {
        while !self.shutdown.is_cancelled()
            && slot.live.load(Ordering::Acquire) < self.config.min_connections
        {
            match self.open(slot).await {
                Ok(conn) => slot.idle.lock().push_back(conn),
                Err(e) => {
                    tracing::warn!(role = slot.role.as_str(), "Failed to open pooled connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Validates idle connections, dropping those that fail.
    async fn check_idle(&self, slot: &Slot) {
        let batch: Vec<_> = slot.idle.lock().drain(..).collect();
        for conn in batch {
            if !conn.is_broken() && conn.is_valid().await {
                slot.idle.lock().push_back(conn);
            } else {
                self.discard(slot);
                self.replaced.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(role = slot.role.as_str(), "Dropped idle connection that failed validation");
            }
        }
    }
}

/// An idle connection taken out for validation. Unless validation hands it
/// back, it is discarded on drop, including when the acquiring future is
/// dropped mid-validation.
struct Candidate<'a> {
    conn: Option<Box<dyn Connection>>,
    shared: &'a Shared,
    slot: &'a Slot,
}

impl Candidate<'_> {
    async fn validate(mut self) -> Option<Box<dyn Connection>> {
        let conn = self.conn.as_ref()?;
        if !conn.is_broken() && conn.is_valid().await {
            self.conn.take()
        } else {
            None
        }
    }
}

impl Drop for Candidate<'_> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.shared.discard(self.slot);
        }
    }
}

/// A shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Creates the pool, pre-warms both roles (privileged first) and starts
    /// the maintenance task. Pre-warm failures are logged, not fatal.
    pub async fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        let max = config.max_connections.max(1);
        let shared = Arc::new(Shared {
            factory,
            privileged: Slot::new(Role::Privileged, max),
            read_only: Slot::new(Role::ReadOnly, max),
            config,
            created: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        shared.top_up(&shared.privileged).await;
        shared.top_up(&shared.read_only).await;

        tokio::spawn(maintain(Arc::downgrade(&shared)));

        Self { shared }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrows a connection for `role`, waiting at most `acquire_timeout`.
    pub async fn acquire(&self, role: Role) -> BackendResult<PooledConnection> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(BackendError::PoolShutdown);
        }
        let slot = shared.slot(role);

        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => return Err(BackendError::PoolShutdown),
            res = tokio::time::timeout(shared.config.acquire_timeout, slot.permits.clone().acquire_owned()) => {
                match res {
                    Err(_) => {
                        shared.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(BackendError::PoolTimeout);
                    }
                    Ok(Err(_)) => return Err(BackendError::PoolShutdown),
                    Ok(Ok(permit)) => permit,
                }
            }
        };

        let conn = loop {
            let candidate = slot.idle.lock().pop_front();
            match candidate {
                Some(conn) => {
                    let candidate = Candidate {
                        conn: Some(conn),
                        shared: &**shared,
                        slot,
                    };
                    if let Some(conn) = candidate.validate().await {
                        break conn;
                    }
                    shared.replaced.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(role = role.as_str(), "Replacing connection that failed validation");
                }
                None => break shared.open(slot).await?,
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            shared: self.shared.clone(),
            role,
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let max = shared.config.max_connections.max(1);
        let mut stats = PoolStats {
            created: shared.created.load(Ordering::Relaxed),
            replaced: shared.replaced.load(Ordering::Relaxed),
            timeouts: shared.timeouts.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in [&shared.privileged, &shared.read_only] {
            stats.idle += slot.idle.lock().len();
            stats.live += slot.live.load(Ordering::Acquire);
            stats.in_use += max.saturating_sub(slot.permits.available_permits());
        }
        stats
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Fails pending and future acquisitions with `PoolShutdown` and closes
    /// idle connections. Borrowed connections are closed when returned.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();
        for slot in [&shared.privileged, &shared.read_only] {
            slot.permits.close();
            let drained: Vec<_> = slot.idle.lock().drain(..).collect();
            for _ in &drained {
                shared.discard(slot);
            }
        }
        tracing::info!("Connection pool shut down");
    }
}

async fn maintain(shared: Weak<Shared>) {
    let (interval, token) = match shared.upgrade() {
        Some(s) => (s.config.health_check_interval, s.shutdown.clone()),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for slot in [&shared.privileged, &shared.read_only] {
            shared.check_idle(slot).await;
            shared.top_up(slot).await;
        }
    }
}

/// A borrowed connection; returned to its pool on drop unless it is broken
/// or was left inside a transaction.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    shared: Arc<Shared>,
    role: Role,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn connection(&self) -> &dyn Connection {
        &**self
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_deref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let slot = self.shared.slot(self.role);
        if self.shared.shutdown.is_cancelled() || conn.is_broken() || conn.in_transaction() {
            self.shared.discard(slot);
            if !self.shared.shutdown.is_cancelled() {
                self.shared.replaced.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        slot.idle.lock().push_back(conn);
    }
}
