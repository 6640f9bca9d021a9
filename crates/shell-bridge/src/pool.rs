//! Bounded per-infrastructure session pools.
//!
//! Session hand-off (acquire/release) happens under a short synchronous lock; handshakes,
//! remote invocations and teardown always run outside it. Capacity is accounted as
//! `idle + in_use + creating`, which never exceeds `max_sessions`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::classify_error;
use crate::error::{BridgeError, InvokeError};
use crate::infra::InfrastructureDescriptor;
use crate::session::{Session, SessionState};
use crate::transport::{CommandRequest, RemoteOutput, ShellConnector};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_sessions: usize,
    pub max_sessions: usize,
    /// Upper bound on how long one acquire may wait, whatever the caller's deadline. Zero
    /// leaves only the caller's deadline.
    pub acquire_timeout: Duration,
    /// Idle sessions older than this are retired before the server expires them. Zero disables.
    pub max_session_age: Duration,
    /// Idle sessions unused for this long are retired. Zero disables.
    pub max_idle: Duration,
    /// Period of the background reconciler. Zero disables it.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 4,
            acquire_timeout: Duration::from_secs(30),
            max_session_age: Duration::from_secs(30 * 60),
            max_idle: Duration::from_secs(10 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    fn normalized(mut self) -> Self {
        self.max_sessions = self.max_sessions.max(1);
        self.min_sessions = self.min_sessions.min(self.max_sessions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub infrastructure_id: String,
    pub idle: usize,
    pub in_use: usize,
    pub creating: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Session>,
    in_use: HashSet<Uuid>,
    creating: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.creating
    }
}

struct PoolInner {
    infrastructure: Arc<InfrastructureDescriptor>,
    connector: Arc<dyn ShellConnector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    warmed: OnceCell<()>,
    shutdown: CancellationToken,
}

enum Step {
    Ready(Session),
    Create(Reservation),
    Wait,
}

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(
        infrastructure: Arc<InfrastructureDescriptor>,
        connector: Arc<dyn ShellConnector>,
        config: PoolConfig,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            infrastructure,
            connector,
            config: config.normalized(),
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            warmed: OnceCell::new(),
            shutdown: CancellationToken::new(),
        });
        spawn_reconciler(&inner);
        Self { inner }
    }

    pub fn infrastructure_id(&self) -> &str {
        &self.inner.infrastructure.id
    }

    /// Hand out a session exclusively until the returned lease is released or dropped.
    pub async fn acquire(&self, deadline: Instant) -> Result<SessionLease, BridgeError> {
        let started = Instant::now();
        let deadline = match self.inner.config.acquire_timeout {
            limit if limit.is_zero() => deadline,
            limit => deadline.min(started + limit),
        };
        self.warm_up(deadline).await;
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);

            let mut retired = Vec::new();
            let step = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(self.inner.closed_error());
                }
                let mut found = None;
                while let Some(session) = state.idle.pop_back() {
                    if self.inner.is_expired(&session) {
                        retired.push(session);
                    } else {
                        found = Some(session);
                        break;
                    }
                }
                match found {
                    Some(mut session) => {
                        session.mark_in_use();
                        state.in_use.insert(session.id());
                        Step::Ready(session)
                    }
                    None if state.total() < self.inner.config.max_sessions => {
                        state.creating += 1;
                        Step::Create(Reservation {
                            pool: Arc::clone(&self.inner),
                            armed: true,
                        })
                    }
                    None => {
                        // register before unlocking so a release cannot slip past us
                        notified.as_mut().enable();
                        Step::Wait
                    }
                }
            };

            for session in retired {
                debug!(
                    infrastructure = %self.inner.infrastructure.id,
                    session_id = %session.id(),
                    "retiring expired idle session on acquire"
                );
                spawn_detached(session.close());
            }

            match step {
                Step::Ready(session) => {
                    return Ok(SessionLease::new(Arc::clone(&self.inner), session));
                }
                Step::Create(reservation) => {
                    return match tokio::time::timeout_at(deadline, self.inner.open()).await {
                        Ok(Ok(session)) => Ok(reservation.into_lease(session)),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(BridgeError::InfrastructureUnreachable {
                            infrastructure: self.inner.infrastructure.id.clone(),
                            message: "session handshake did not finish before the deadline".into(),
                        }),
                    };
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        warn!(
                            infrastructure = %self.inner.infrastructure.id,
                            waited_ms,
                            "session pool exhausted"
                        );
                        return Err(BridgeError::PoolExhausted {
                            infrastructure: self.inner.infrastructure.id.clone(),
                            waited_ms,
                        });
                    }
                }
            }
        }
    }

    /// On first use, create `min_sessions` before serving anyone.
    async fn warm_up(&self, deadline: Instant) {
        if self.inner.config.min_sessions == 0 || self.inner.warmed.initialized() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let warming = self.inner.warmed.get_or_init(|| async move {
            let infrastructure = inner.infrastructure.id.clone();
            // detached so a caller hitting its deadline cannot strand half-open slots
            match tokio::spawn(async move { inner.top_up().await }).await {
                Ok(created) => info!(%infrastructure, created, "session pool warmed"),
                Err(err) => warn!(%infrastructure, error = %err, "session pool warm-up aborted"),
            }
        });
        if tokio::time::timeout_at(deadline, warming).await.is_err() {
            debug!(
                infrastructure = %self.inner.infrastructure.id,
                "warm-up still running at deadline"
            );
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            infrastructure_id: self.inner.infrastructure.id.clone(),
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            creating: state.creating,
            min: self.inner.config.min_sessions,
            max: self.inner.config.max_sessions,
        }
    }

    /// Retire aged idle sessions and restore the warm floor.
    pub async fn reconcile(&self) {
        self.inner.reap().await;
    }

    /// Stop the reconciler, close idle sessions and fail pending waiters. Leased sessions
    /// are closed when their lease comes back.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let idle: Vec<Session> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_waiters();
        let count = idle.len();
        join_all(idle.into_iter().map(Session::close)).await;
        info!(
            infrastructure = %self.inner.infrastructure.id,
            closed = count,
            "session pool shut down"
        );
    }
}

impl PoolInner {
    fn closed_error(&self) -> BridgeError {
        BridgeError::InfrastructureUnreachable {
            infrastructure: self.infrastructure.id.clone(),
            message: "session pool is shut down".into(),
        }
    }

    fn is_expired(&self, session: &Session) -> bool {
        let age_limit = self.config.max_session_age;
        let idle_limit = self.config.max_idle;
        (!age_limit.is_zero() && session.age() >= age_limit)
            || (!idle_limit.is_zero() && session.idle_for() >= idle_limit)
    }

    async fn open(&self) -> Result<Session, BridgeError> {
        let transport = self
            .connector
            .connect(&self.infrastructure, None)
            .await
            .map_err(|err| {
                let class = classify_error(&err);
                warn!(
                    infrastructure = %self.infrastructure.id,
                    class = class.as_str(),
                    error = %err,
                    "session handshake failed"
                );
                BridgeError::from_invoke(class, err, &self.infrastructure.id)
            })?;
        let session = Session::new(self.infrastructure.id.clone(), transport);
        debug!(
            infrastructure = %self.infrastructure.id,
            session_id = %session.id(),
            "session opened"
        );
        Ok(session)
    }

    /// Claim a creation slot while the pool holds fewer than `limit` sessions.
    fn reserve(self: &Arc<Self>, limit: usize) -> Option<Reservation> {
        let mut state = self.state.lock();
        if state.closed || state.total() >= limit {
            return None;
        }
        state.creating += 1;
        Some(Reservation {
            pool: Arc::clone(self),
            armed: true,
        })
    }

    fn check_in(self: &Arc<Self>, mut session: Session, healthy: bool) {
        if !healthy || session.state() == SessionState::Broken {
            self.discard(session, "released unhealthy");
            return;
        }
        session.mark_idle();
        if self.is_expired(&session) {
            self.discard(session, "exceeded max session age");
            return;
        }

        let id = session.id();
        let stray = {
            let mut state = self.state.lock();
            if !state.in_use.remove(&id) || state.closed {
                Some(session)
            } else {
                state.idle.push_back(session);
                None
            }
        };
        match stray {
            None => self.available.notify_one(),
            Some(session) => {
                debug!(
                    infrastructure = %self.infrastructure.id,
                    session_id = %id,
                    "closing session returned to a closed pool or not tracked by it"
                );
                spawn_detached(session.close());
            }
        }
    }

    fn discard(self: &Arc<Self>, session: Session, reason: &'static str) {
        let below_floor = {
            let mut state = self.state.lock();
            state.in_use.remove(&session.id());
            !state.closed && state.total() < self.config.min_sessions
        };
        warn!(
            infrastructure = %self.infrastructure.id,
            session_id = %session.id(),
            reason,
            "discarding session"
        );
        self.available.notify_one();
        spawn_detached(session.close());
        if below_floor {
            let inner = Arc::clone(self);
            spawn_detached(async move {
                inner.top_up().await;
            });
        }
    }

    async fn top_up(self: &Arc<Self>) -> usize {
        let mut reservations = Vec::new();
        while let Some(reservation) = self.reserve(self.config.min_sessions) {
            reservations.push(reservation);
        }
        if reservations.is_empty() {
            return 0;
        }
        let opened = join_all(
            reservations
                .into_iter()
                .map(|reservation| async move { (reservation, self.open().await) }),
        )
        .await;

        let mut created = 0;
        for (reservation, result) in opened {
            if let Ok(session) = result {
                if reservation.into_idle(session) {
                    created += 1;
                }
            }
        }
        created
    }

    async fn reap(self: &Arc<Self>) {
        let retired: VecDeque<Session> = {
            let mut state = self.state.lock();
            let (keep, retire): (VecDeque<Session>, VecDeque<Session>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|session| !self.is_expired(session));
            state.idle = keep;
            retire
        };
        if !retired.is_empty() {
            info!(
                infrastructure = %self.infrastructure.id,
                retired = retired.len(),
                "retiring aged idle sessions"
            );
            join_all(retired.into_iter().map(Session::close)).await;
        }
        let created = self.top_up().await;
        if created > 0 {
            debug!(infrastructure = %self.infrastructure.id, created, "restored warm floor");
        }
    }
}

/// A claimed creation slot; releases the slot if dropped before it is filled.
struct Reservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    fn into_lease(mut self, mut session: Session) -> SessionLease {
        self.armed = false;
        session.mark_in_use();
        {
            let mut state = self.pool.state.lock();
            state.creating -= 1;
            state.in_use.insert(session.id());
        }
        SessionLease::new(Arc::clone(&self.pool), session)
    }

    fn into_idle(mut self, session: Session) -> bool {
        self.armed = false;
        let rejected = {
            let mut state = self.pool.state.lock();
            state.creating -= 1;
            if state.closed {
                Some(session)
            } else {
                state.idle.push_back(session);
                None
            }
        };
        match rejected {
            Some(session) => {
                spawn_detached(session.close());
                false
            }
            None => {
                self.pool.available.notify_one();
                true
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().creating -= 1;
            self.pool.available.notify_one();
        }
    }
}

/// Exclusive loan of one session. Dropping it without [`SessionLease::release`] discards
/// the session, since its remote state is unknown.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    session: Option<Session>,
}

impl SessionLease {
    fn new(pool: Arc<PoolInner>, session: Session) -> Self {
        Self {
            pool,
            session: Some(session),
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(Session::id)
    }

    pub async fn invoke(
        &mut self,
        request: &CommandRequest,
        timeout: Duration,
    ) -> Result<RemoteOutput, InvokeError> {
        let Some(session) = self.session.as_mut() else {
            return Err(InvokeError::Dropped("lease no longer holds a session".into()));
        };
        session.invoke(request, timeout).await
    }

    /// Return the session: back to the idle set when `healthy`, otherwise closed.
    pub fn release(mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(session, healthy);
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("infrastructure_id", &self.pool.infrastructure.id)
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.discard(session, "lease dropped before release");
        }
    }
}

fn spawn_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => debug!("no runtime available; dropping background pool task"),
    }
}

fn spawn_reconciler(inner: &Arc<PoolInner>) {
    let interval = inner.config.reap_interval;
    if interval.is_zero() {
        return;
    }
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let token = inner.shutdown.clone();
    spawn_detached(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.reap().await;
                }
            }
        }
    });
}

/// One pool per infrastructure, owned by the process composition root.
pub struct PoolRegistry {
    connector: Arc<dyn ShellConnector>,
    config: PoolConfig,
    pools: DashMap<String, SessionPool>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn ShellConnector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            pools: DashMap::new(),
        }
    }

    pub fn pool(&self, infrastructure: &Arc<InfrastructureDescriptor>) -> SessionPool {
        self.pools
            .entry(infrastructure.id.clone())
            .or_insert_with(|| {
                SessionPool::new(
                    Arc::clone(infrastructure),
                    Arc::clone(&self.connector),
                    self.config.clone(),
                )
            })
            .clone()
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.infrastructure_id.cmp(&b.infrastructure_id));
        stats
    }

    pub async fn shutdown(&self) {
        let pools: Vec<SessionPool> = self.pools.iter().map(|entry| entry.value().clone()).collect();
        join_all(pools.iter().map(SessionPool::shutdown)).await;
    }
}
