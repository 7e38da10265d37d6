//! Pairing and forwarding engine

use crate::config::RelayConfig;
use crate::connection::{close_connection, FramedConnection};
use crate::error::{RelayError, Result};
use crate::id::PairingId;
use crate::registry::{Join, Pairing, Rejected, SessionRegistry, Waiter};
use crate::session::{pipe, CloseReason, Direction, PipeStats, Role};
use crate::stats::{RelayEvent, RelayStats};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// What a finished `accept` call observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: PairingId,
    pub session_id: u64,
    pub role: Role,
    /// Why forwarding stopped; `None` for a responder, whose connection
    /// is forwarded by the initiator's task
    pub reason: Option<CloseReason>,
    pub stats: PipeStats,
}

impl SessionReport {
    fn handed_off(id: PairingId, session_id: u64) -> Self {
        Self {
            id,
            session_id,
            role: Role::Responder,
            reason: None,
            stats: PipeStats::default(),
        }
    }
}

/// How waiting for a peer ended
enum Wait<C> {
    Joined(Pairing<C>),
    /// Session removed by `release`
    Released,
    GaveUp(GiveUp),
}

enum GiveUp {
    TimedOut,
    Shutdown,
    /// Initiator hung up (`None`) or its connection failed
    Disconnected(Option<io::Error>),
}

struct Inner<C> {
    config: RelayConfig,
    registry: SessionRegistry<C>,
    stats: RwLock<RelayStats>,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Pairing and forwarding engine
///
/// Cheap to clone; all clones share one registry.
pub struct Relay<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Relay<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Keeps a registry entry alive for the duration of a task and removes it
/// when the task finishes or is dropped
struct Lease<'a, C> {
    registry: &'a SessionRegistry<C>,
    id: PairingId,
    session_id: u64,
    waiting: bool,
}

impl<C> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        if self.waiting {
            self.registry.expire(&self.id, self.session_id);
        } else {
            self.registry.release_session(&self.id, self.session_id);
        }
    }
}

impl<C: FramedConnection> Relay<C> {
    pub fn new(config: RelayConfig) -> Self {
        let shutdown = CancellationToken::new();
        let registry = SessionRegistry::new(config.registry_shards, config.max_sessions)
            .with_shutdown(shutdown.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                stats: RwLock::new(RelayStats::default()),
                events,
                shutdown,
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry<C> {
        &self.inner.registry
    }

    /// Number of paired sessions
    pub fn active_sessions(&self) -> usize {
        self.inner.registry.active_count()
    }

    /// Number of sessions waiting for a peer
    pub fn pending_sessions(&self) -> usize {
        self.inner.registry.pending_count()
    }

    /// Get relay statistics
    pub fn stats(&self) -> RelayStats {
        self.inner.stats.read().clone()
    }

    /// Subscribe to session lifecycle events
    ///
    /// Events of one session arrive in lifecycle order: `Waiting` and
    /// `Paired` are both emitted by the initiator's task.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Has `close` been called?
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Tear down the session for `id`, whatever its state
    pub fn release(&self, id: &PairingId) -> bool {
        let released = self.inner.registry.release(id);
        if released {
            info!("Released session for {}", id);
        }
        released
    }

    /// Pair `conn` under `id` and run its session
    ///
    /// An initiator keeps its connection while waiting, then forwards the
    /// pair and returns when forwarding stopped. It fails with
    /// `PairingTimeout` or `Closed` if no peer shows up. A responder hands
    /// its connection to the initiator and returns right away.
    pub async fn accept(&self, id: PairingId, conn: C) -> Result<SessionReport> {
        self.inner
            .tracker
            .track_future(self.run_session(id, conn))
            .await
    }

    /// Like `accept`, on a new task that `close` waits for
    pub fn spawn_accept(&self, id: PairingId, conn: C) -> JoinHandle<Result<SessionReport>> {
        let relay = self.clone();
        self.inner
            .tracker
            .spawn(async move { relay.run_session(id, conn).await })
    }

    /// Stop accepting, close every session and wait for their tasks
    pub async fn close(&self) {
        info!(
            "Closing relay ({} active, {} pending sessions)",
            self.active_sessions(),
            self.pending_sessions()
        );
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("All relay sessions released");
    }

    async fn run_session(&self, id: PairingId, conn: C) -> Result<SessionReport> {
        let inner = &self.inner;

        if self.is_closed() {
            close_connection(conn, inner.config.close_timeout).await;
            return Err(RelayError::Closed);
        }

        match inner.registry.join_or_create(id, conn) {
            Ok(Join::Initiator { waiter, conn }) => self.wait_for_peer(waiter, conn).await,
            Ok(Join::Responder { session_id }) => {
                debug!("Session {} on {} handed to its initiator", session_id, id);
                Ok(SessionReport::handed_off(id, session_id))
            }
            Err(Rejected { conn, error }) => {
                self.record_rejection(id, &error);
                close_connection(conn, inner.config.close_timeout).await;
                Err(error)
            }
        }
    }

    async fn wait_for_peer(&self, waiter: Waiter<C>, mut conn: C) -> Result<SessionReport> {
        let inner = &self.inner;
        let Waiter {
            id,
            session_id,
            mut joined,
        } = waiter;
        let mut lease = Lease {
            registry: &inner.registry,
            id,
            session_id,
            waiting: true,
        };

        inner.stats.write().sessions_opened += 1;
        self.emit(RelayEvent::Waiting { id, session_id });
        debug!("Session {} waiting for peer on {}", session_id, id);

        let deadline = tokio::time::sleep(inner.config.pairing_timeout);
        tokio::pin!(deadline);
        // At most one frame is read ahead while waiting
        let mut early: Option<BytesMut> = None;

        let wait = loop {
            tokio::select! {
                res = &mut joined => break match res {
                    Ok(pairing) => Wait::Joined(pairing),
                    Err(_) => Wait::Released,
                },
                frame = conn.next(), if early.is_none() => match frame {
                    Some(Ok(frame)) => early = Some(frame),
                    Some(Err(e)) => break Wait::GaveUp(GiveUp::Disconnected(Some(e))),
                    None => break Wait::GaveUp(GiveUp::Disconnected(None)),
                },
                _ = &mut deadline => break Wait::GaveUp(GiveUp::TimedOut),
                _ = inner.shutdown.cancelled() => break Wait::GaveUp(GiveUp::Shutdown),
            }
        };

        let pairing = match wait {
            Wait::Joined(pairing) => pairing,
            Wait::Released => {
                debug!("Session {} on {} released while waiting", session_id, id);
                close_connection(conn, inner.config.close_timeout).await;
                return Err(RelayError::Closed);
            }
            Wait::GaveUp(reason) => {
                if inner.registry.expire(&id, session_id) {
                    return self.give_up(id, session_id, conn, reason).await;
                }
                // Paired while giving up; the peer's connection is already sent
                match joined.try_recv() {
                    Ok(pairing) => pairing,
                    Err(_) => {
                        close_connection(conn, inner.config.close_timeout).await;
                        return Err(RelayError::Closed);
                    }
                }
            }
        };

        lease.waiting = false;
        self.forward_pair(lease, conn, early.map(BytesMut::freeze), pairing)
            .await
    }

    /// Close an initiator whose session was expired without a peer
    async fn give_up(
        &self,
        id: PairingId,
        session_id: u64,
        conn: C,
        reason: GiveUp,
    ) -> Result<SessionReport> {
        let inner = &self.inner;

        let result = match reason {
            GiveUp::TimedOut => {
                inner.stats.write().pairing_timeouts += 1;
                self.emit(RelayEvent::Expired { id, session_id });
                info!("Pairing timed out for {}", id);
                Err(RelayError::PairingTimeout(id))
            }
            GiveUp::Shutdown => Err(RelayError::Closed),
            GiveUp::Disconnected(error) => {
                inner.stats.write().abandoned_waits += 1;
                self.emit(RelayEvent::Abandoned { id, session_id });
                info!("Initiator on {} left before a peer arrived", id);
                match error {
                    Some(source) => Err(RelayError::Forwarding {
                        id,
                        direction: Direction::InitiatorToResponder,
                        source,
                    }),
                    None => Ok(SessionReport {
                        id,
                        session_id,
                        role: Role::Initiator,
                        reason: Some(CloseReason::Ended(Direction::InitiatorToResponder)),
                        stats: PipeStats::default(),
                    }),
                }
            }
        };

        close_connection(conn, inner.config.close_timeout).await;
        result
    }

    async fn forward_pair(
        &self,
        lease: Lease<'_, C>,
        initiator: C,
        early: Option<Bytes>,
        pairing: Pairing<C>,
    ) -> Result<SessionReport> {
        let inner = &self.inner;
        let (id, session_id) = (lease.id, lease.session_id);

        inner.stats.write().sessions_paired += 1;
        self.emit(RelayEvent::Paired { id, session_id });
        info!(
            "Session {} paired on {} after {:?}",
            session_id, id, pairing.waited
        );

        let outcome = pipe(
            initiator,
            pairing.conn,
            early,
            pairing.cancel,
            inner.config.close_timeout,
        )
        .await;
        drop(lease);

        {
            let mut stats = inner.stats.write();
            stats.sessions_closed += 1;
            stats.frames_forwarded += outcome.stats.total_frames();
            stats.bytes_forwarded += outcome.stats.total_bytes();
            if outcome.error.is_some() {
                stats.forwarding_errors += 1;
            }
        }
        self.emit(RelayEvent::Closed {
            id,
            session_id,
            reason: outcome.reason,
            stats: outcome.stats,
        });

        match (outcome.reason, outcome.error) {
            (CloseReason::Failed(direction), Some(source)) => {
                warn!(
                    "Session {} on {} failed ({}): {}",
                    session_id, id, direction, source
                );
                Err(RelayError::Forwarding {
                    id,
                    direction,
                    source,
                })
            }
            (reason, _) => {
                info!(
                    "Session {} on {} closed ({:?}, {} bytes relayed)",
                    session_id,
                    id,
                    reason,
                    outcome.stats.total_bytes()
                );
                Ok(SessionReport {
                    id,
                    session_id,
                    role: Role::Initiator,
                    reason: Some(reason),
                    stats: outcome.stats,
                })
            }
        }
    }

    fn record_rejection(&self, id: PairingId, error: &RelayError) {
        {
            let mut stats = self.inner.stats.write();
            match error {
                RelayError::DuplicatePairing(_) => stats.duplicate_rejections += 1,
                RelayError::CapacityExhausted { .. } => stats.capacity_rejections += 1,
                _ => {}
            }
        }
        self.emit(RelayEvent::Rejected {
            id,
            reason: error.kind(),
        });

        match error {
            RelayError::CapacityExhausted { .. } => error!("Rejected connection for {}: {}", id, error),
            _ => info!("Rejected connection for {}: {}", id, error),
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}
