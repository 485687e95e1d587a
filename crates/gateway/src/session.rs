//! Live WebSocket sessions and their per-session admission layer.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use {
    dashmap::DashMap,
    tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

use relay_protocol::{ErrorKind, ErrorShape};

use {
    relay_common::{Clock, SystemClock},
    crate::{health::HealthState, outbound::ConnQueue},
};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Authenticated, at least one call in flight.
    Active,
    /// Authenticated, nothing in flight.
    Quiesced,
    /// Disconnected or reaped.
    Closed,
}

/// One authenticated connection.
pub struct Session {
    pub id: Uuid,
    pub client_name: String,
    pub queue: Arc<ConnQueue>,
    pub semaphore: Arc<Semaphore>,
    /// Cancels every in-flight call when the connection dies.
    pub cancel: CancellationToken,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    inflight: AtomicUsize,
    /// Calls currently waiting for a permit; bounded by the configured
    /// queue depth.
    queued: AtomicUsize,
    /// Cancellation handles for in-flight calls, keyed by request id.
    pub calls: DashMap<String, CancellationToken>,
}

impl Session {
    pub fn touch(&self, now: Instant) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = now;
        }
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.cancel.is_cancelled() {
            SessionPhase::Closed
        } else if self.inflight() > 0 {
            SessionPhase::Active
        } else {
            SessionPhase::Quiesced
        }
    }
}

/// Permit for one call on one session. Releasing restores the session's
/// capacity and inflight accounting.
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
    session: Arc<Session>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.session.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
    per_session_cap: usize,
    queue_depth: usize,
    idle_ttl: std::time::Duration,
    clock: Arc<dyn Clock>,
    health: Arc<HealthState>,
    /// Parent for every session's cancellation token.
    shutdown: CancellationToken,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        per_session_cap: usize,
        queue_depth: usize,
        idle_ttl: std::time::Duration,
        health: Arc<HealthState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_clock(
            per_session_cap,
            queue_depth,
            idle_ttl,
            health,
            shutdown,
            Arc::new(SystemClock),
        )
    }

    #[must_use]
    pub fn with_clock(
        per_session_cap: usize,
        queue_depth: usize,
        idle_ttl: std::time::Duration,
        health: Arc<HealthState>,
        shutdown: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            per_session_cap: per_session_cap.max(1),
            queue_depth,
            idle_ttl,
            clock,
            health,
            shutdown,
        }
    }

    /// Register a session for an authenticated connection.
    pub fn create(&self, client_name: String, queue: Arc<ConnQueue>) -> Arc<Session> {
        let now = self.clock.now();
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            client_name,
            queue,
            semaphore: Arc::new(Semaphore::new(self.per_session_cap)),
            cancel: self.shutdown.child_token(),
            created_at: now,
            last_activity: Mutex::new(now),
            inflight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            calls: DashMap::new(),
        });
        self.sessions.insert(session.id, Arc::clone(&session));
        self.health.session_opened();
        session
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| Arc::clone(&s))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Sum of in-flight calls across all sessions.
    #[must_use]
    pub fn total_inflight(&self) -> usize {
        self.sessions.iter().map(|s| s.inflight()).sum()
    }

    /// Acquire a per-session permit, waiting no longer than the deadline.
    ///
    /// Fails `SessionOverloaded` only on the two-part condition: the
    /// semaphore is exhausted AND the wait queue is full. A queued wait
    /// that outlives the deadline fails `Overloaded`.
    pub async fn acquire(
        &self,
        session: &Arc<Session>,
        deadline: Instant,
    ) -> Result<SessionPermit, ErrorShape> {
        match Arc::clone(&session.semaphore).try_acquire_owned() {
            Ok(permit) => {
                session.inflight.fetch_add(1, Ordering::Relaxed);
                return Ok(SessionPermit {
                    _permit: permit,
                    session: Arc::clone(session),
                });
            },
            Err(TryAcquireError::NoPermits) => {},
            Err(TryAcquireError::Closed) => {
                return Err(ErrorShape::new(
                    ErrorKind::Internal,
                    "session semaphore closed",
                ));
            },
        }

        // Exhausted: join the bounded wait queue.
        if session.queued.fetch_add(1, Ordering::AcqRel) >= self.queue_depth {
            session.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(ErrorShape::new(
                ErrorKind::SessionOverloaded,
                "session concurrency saturated and wait queue full",
            ));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let waited = tokio::time::timeout(
            remaining,
            Arc::clone(&session.semaphore).acquire_owned(),
        )
        .await;
        session.queued.fetch_sub(1, Ordering::AcqRel);

        match waited {
            Ok(Ok(permit)) => {
                session.inflight.fetch_add(1, Ordering::Relaxed);
                Ok(SessionPermit {
                    _permit: permit,
                    session: Arc::clone(session),
                })
            },
            Ok(Err(_)) => Err(ErrorShape::new(
                ErrorKind::Internal,
                "session semaphore closed",
            )),
            Err(_) => Err(ErrorShape::new(
                ErrorKind::Overloaded,
                "session concurrency saturated",
            )),
        }
    }

    /// Remove a session on disconnect, cancelling its in-flight calls.
    pub fn close(&self, id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            session.cancel.cancel();
            session.queue.close();
            self.health.session_closed();
        }
    }

    /// Drop sessions idle past the TTL. Their in-flight calls observe
    /// cancellation.
    pub fn reap(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| now.duration_since(s.last_activity()) >= self.idle_ttl)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            tracing::info!(session = %id, "reaping idle session");
            self.close(*id);
        }
        expired.len()
    }

    /// Ids of all live sessions.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|s| s.id).collect()
    }
}
