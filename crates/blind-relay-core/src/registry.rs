//! Session registry
//!
//! Maps pairing identifiers to live sessions. The table is split into
//! independently locked shards so that pairing decisions for different
//! identifiers never contend on one lock, while two connections racing on
//! the same identifier are serialized by their shard lock. Locks are only
//! held for a lookup plus a state transition, never across I/O.
//!
//! A waiting session does not hold its connection; the initiator's task
//! keeps it so that a disconnect is noticed while waiting. The responder's
//! connection is handed to that task when the pair forms.

use crate::error::RelayError;
use crate::id::PairingId;
use parking_lot::Mutex;
use std::collections::hash_map::{Entry, HashMap, RandomState};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Externally visible session state
///
/// `Closed` sessions are not stored; they are removed from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// One connection parked, waiting for its peer
    Waiting,
    /// Two connections bound, forwarding in progress
    Paired,
}

/// Outcome of a successful `join_or_create`
pub enum Join<C> {
    /// First connection for this identifier; its task keeps the connection
    /// and waits for a peer
    Initiator { waiter: Waiter<C>, conn: C },
    /// Second connection; it was handed to the waiting initiator
    Responder { session_id: u64 },
}

/// Delivered to a waiting initiator when its peer joins
pub struct Pairing<C> {
    pub session_id: u64,
    /// Connection of the responder
    pub conn: C,
    /// Cancelled when the session is released or the relay shuts down
    pub cancel: CancellationToken,
    /// Time the initiator spent waiting
    pub waited: Duration,
}

/// A connection the registry refused, handed back so the caller can close it
pub struct Rejected<C> {
    pub conn: C,
    pub error: RelayError,
}

impl<C> std::fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected").field("error", &self.error).finish()
    }
}

/// Handle held by the task of a waiting initiator
pub struct Waiter<C> {
    pub id: PairingId,
    pub session_id: u64,
    /// Resolves when a responder joins; errors if the session was released
    pub joined: oneshot::Receiver<Pairing<C>>,
}

impl<C> std::fmt::Debug for Waiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

struct Slot<C> {
    session_id: u64,
    created_at: Instant,
    state: SlotState<C>,
}

enum SlotState<C> {
    Waiting { joined: oneshot::Sender<Pairing<C>> },
    Paired { cancel: CancellationToken },
}

impl<C> SlotState<C> {
    fn state(&self) -> SessionState {
        match self {
            Self::Waiting { .. } => SessionState::Waiting,
            Self::Paired { .. } => SessionState::Paired,
        }
    }
}

/// Concurrent create-or-join session table
pub struct SessionRegistry<C> {
    shards: Box<[Mutex<HashMap<PairingId, Slot<C>>>]>,
    hasher: RandomState,
    /// Maximum live sessions (0 = unbounded)
    max_sessions: usize,
    next_session_id: AtomicU64,
    /// Live sessions, reserved before insertion
    sessions: AtomicUsize,
    waiting: AtomicUsize,
    paired: AtomicUsize,
    /// Parent of every paired session's cancellation token
    shutdown: CancellationToken,
}

impl<C> SessionRegistry<C> {
    pub fn new(shards: usize, max_sessions: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            hasher: RandomState::new(),
            max_sessions,
            next_session_id: AtomicU64::new(1),
            sessions: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            paired: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie paired sessions to an outer shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn shard(&self, id: &PairingId) -> &Mutex<HashMap<PairingId, Slot<C>>> {
        let index = self.hasher.hash_one(id) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Reserve room for one more session
    fn reserve(&self) -> bool {
        if self.max_sessions == 0 {
            self.sessions.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        self.sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .is_ok()
    }

    /// New waiting slot and the waiter handle that goes with it
    fn park(&self, id: PairingId) -> (Slot<C>, Waiter<C>) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (joined_tx, joined_rx) = oneshot::channel();
        let slot = Slot {
            session_id,
            created_at: Instant::now(),
            state: SlotState::Waiting { joined: joined_tx },
        };
        let waiter = Waiter {
            id,
            session_id,
            joined: joined_rx,
        };
        (slot, waiter)
    }

    /// Create a waiting session, or pair with the one already waiting
    ///
    /// A third connection for an identifier that is already paired is
    /// rejected with `DuplicatePairing`; the existing pair is untouched.
    /// If the waiting initiator's task is already gone, the new connection
    /// takes its place as initiator instead of pairing with nobody.
    pub fn join_or_create(&self, id: PairingId, conn: C) -> Result<Join<C>, Rejected<C>> {
        let mut shard = self.shard(&id).lock();

        match shard.entry(id) {
            Entry::Vacant(vacant) => {
                if !self.reserve() {
                    return Err(Rejected {
                        conn,
                        error: RelayError::CapacityExhausted {
                            max: self.max_sessions,
                        },
                    });
                }

                let (slot, waiter) = self.park(id);
                vacant.insert(slot);
                self.waiting.fetch_add(1, Ordering::SeqCst);
                Ok(Join::Initiator { waiter, conn })
            }
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let cancel = self.shutdown.child_token();
                let previous = std::mem::replace(
                    &mut slot.state,
                    SlotState::Paired {
                        cancel: cancel.clone(),
                    },
                );

                let joined = match previous {
                    SlotState::Waiting { joined } => joined,
                    paired @ SlotState::Paired { .. } => {
                        slot.state = paired;
                        return Err(Rejected {
                            conn,
                            error: RelayError::DuplicatePairing(id),
                        });
                    }
                };

                let pairing = Pairing {
                    session_id: slot.session_id,
                    conn,
                    cancel,
                    waited: slot.created_at.elapsed(),
                };
                match joined.send(pairing) {
                    Ok(()) => {
                        self.waiting.fetch_sub(1, Ordering::SeqCst);
                        self.paired.fetch_add(1, Ordering::SeqCst);
                        Ok(Join::Responder {
                            session_id: slot.session_id,
                        })
                    }
                    Err(Pairing { conn, .. }) => {
                        // Still one waiting session, now owned by this connection
                        let (fresh, waiter) = self.park(id);
                        *slot = fresh;
                        Ok(Join::Initiator { waiter, conn })
                    }
                }
            }
        }
    }

    /// Remove a still-waiting session
    ///
    /// Returns `false` if the session was paired or released in the meantime.
    pub fn expire(&self, id: &PairingId, session_id: u64) -> bool {
        let mut shard = self.shard(id).lock();

        let is_waiting = shard.get(id).is_some_and(|slot| {
            slot.session_id == session_id && matches!(slot.state, SlotState::Waiting { .. })
        });
        if !is_waiting {
            return false;
        }

        match shard.remove(id) {
            Some(slot) => {
                self.forget(&slot.state);
                true
            }
            None => false,
        }
    }

    /// Release one specific session; a newer session under the same
    /// identifier is left alone
    pub fn release_session(&self, id: &PairingId, session_id: u64) -> bool {
        let mut shard = self.shard(id).lock();

        if shard.get(id).map(|slot| slot.session_id) != Some(session_id) {
            return false;
        }
        match shard.remove(id) {
            Some(slot) => {
                self.forget(&slot.state);
                Self::cancel(slot.state);
                true
            }
            None => false,
        }
    }

    /// Release whatever session is registered for `id`
    ///
    /// A waiting initiator is woken and closes its connection; a paired
    /// session's forwarding is cancelled. Idempotent.
    pub fn release(&self, id: &PairingId) -> bool {
        let removed = self.shard(id).lock().remove(id);
        match removed {
            Some(slot) => {
                self.forget(&slot.state);
                Self::cancel(slot.state);
                true
            }
            None => false,
        }
    }

    /// Adjust counters for a slot that was just removed
    fn forget(&self, state: &SlotState<C>) {
        match state {
            SlotState::Waiting { .. } => self.waiting.fetch_sub(1, Ordering::SeqCst),
            SlotState::Paired { .. } => self.paired.fetch_sub(1, Ordering::SeqCst),
        };
        self.sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn cancel(state: SlotState<C>) {
        if let SlotState::Paired { cancel } = state {
            cancel.cancel();
        }
    }

    /// Number of paired sessions
    pub fn active_count(&self) -> usize {
        self.paired.load(Ordering::SeqCst)
    }

    /// Number of sessions waiting for a peer
    pub fn pending_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Number of live sessions in any state
    pub fn len(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current state of the session for `id`, if any
    pub fn state(&self, id: &PairingId) -> Option<SessionState> {
        self.shard(id).lock().get(id).map(|slot| slot.state.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn id(byte: u8) -> PairingId {
        PairingId([byte; 32])
    }

    fn initiator(join: Join<u32>) -> Waiter<u32> {
        match join {
            Join::Initiator { waiter, .. } => waiter,
            Join::Responder { .. } => panic!("expected initiator"),
        }
    }

    #[test]
    fn test_first_connection_waits() {
        let registry = SessionRegistry::new(4, 0);
        let waiter = initiator(registry.join_or_create(id(1), 10).unwrap());

        assert_eq!(waiter.id, id(1));
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.state(&id(1)), Some(SessionState::Waiting));
    }

    #[test]
    fn test_second_connection_pairs() {
        let registry = SessionRegistry::new(4, 0);
        let mut waiter = initiator(registry.join_or_create(id(1), 10).unwrap());

        match registry.join_or_create(id(1), 20).unwrap() {
            Join::Responder { session_id } => assert_eq!(session_id, waiter.session_id),
            Join::Initiator { .. } => panic!("expected responder"),
        }

        let pairing = waiter.joined.try_recv().unwrap();
        assert_eq!(pairing.conn, 20);
        assert_eq!(pairing.session_id, waiter.session_id);
        assert!(!pairing.cancel.is_cancelled());
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.state(&id(1)), Some(SessionState::Paired));
    }

    #[test]
    fn test_third_connection_rejected() {
        let registry = SessionRegistry::new(4, 0);
        let _waiter = initiator(registry.join_or_create(id(1), 10).unwrap());
        let _pair = registry.join_or_create(id(1), 20).unwrap();

        let rejected = match registry.join_or_create(id(1), 30) {
            Err(rejected) => rejected,
            Ok(_) => panic!("third connection must be rejected"),
        };
        assert_eq!(rejected.conn, 30);
        assert!(matches!(rejected.error, RelayError::DuplicatePairing(i) if i == id(1)));

        // Existing pair untouched
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.state(&id(1)), Some(SessionState::Paired));
    }

    #[test]
    fn test_gone_initiator_is_replaced() {
        let registry = SessionRegistry::new(4, 0);
        let old = initiator(registry.join_or_create(id(1), 10).unwrap());
        let old_session = old.session_id;
        drop(old);

        let _fresh = match registry.join_or_create(id(1), 20).unwrap() {
            Join::Initiator { waiter, conn } => {
                assert_eq!(conn, 20);
                assert_ne!(waiter.session_id, old_session);
                waiter
            }
            Join::Responder { .. } => panic!("must not pair with a gone initiator"),
        };
        assert_eq!(registry.pending_count(), 1);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.len(), 1);

        // The old task's cleanup must not remove the new session
        assert!(!registry.expire(&id(1), old_session));
        assert_eq!(registry.state(&id(1)), Some(SessionState::Waiting));
    }

    #[test]
    fn test_identifiers_are_independent() {
        let registry = SessionRegistry::new(4, 0);
        let _a = initiator(registry.join_or_create(id(1), 1).unwrap());
        let _b = initiator(registry.join_or_create(id(2), 2).unwrap());

        assert_eq!(registry.pending_count(), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_expire_waiting_session() {
        let registry = SessionRegistry::new(4, 0);
        let waiter = initiator(registry.join_or_create(id(1), 10).unwrap());

        assert!(registry.expire(&id(1), waiter.session_id));
        assert_eq!(registry.pending_count(), 0);
        assert!(registry.is_empty());

        // Identifier immediately reusable
        let again = initiator(registry.join_or_create(id(1), 11).unwrap());
        assert_ne!(again.session_id, waiter.session_id);
    }

    #[test]
    fn test_expire_ignores_paired_session() {
        let registry = SessionRegistry::new(4, 0);
        let waiter = initiator(registry.join_or_create(id(1), 10).unwrap());
        let _pair = registry.join_or_create(id(1), 20).unwrap();

        assert!(!registry.expire(&id(1), waiter.session_id));
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_stale_release_keeps_newer_session() {
        let registry = SessionRegistry::new(4, 0);
        let old = initiator(registry.join_or_create(id(1), 10).unwrap());
        registry.expire(&id(1), old.session_id);
        let _new = initiator(registry.join_or_create(id(1), 11).unwrap());

        assert!(!registry.release_session(&id(1), old.session_id));
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = SessionRegistry::new(4, 0);
        let mut waiter = initiator(registry.join_or_create(id(1), 10).unwrap());
        registry.join_or_create(id(1), 20).unwrap();
        let cancel = waiter.joined.try_recv().unwrap().cancel;

        assert!(registry.release_session(&id(1), waiter.session_id));
        assert!(cancel.is_cancelled());
        assert!(!registry.release_session(&id(1), waiter.session_id));
        assert!(!registry.release(&id(1)));
        assert_eq!(registry.active_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let registry = SessionRegistry::new(4, 0);
        let mut waiter = initiator(registry.join_or_create(id(1), 10).unwrap());

        assert!(registry.release(&id(1)));
        assert!(matches!(
            waiter.joined.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_shutdown_cancels_paired_sessions() {
        let shutdown = CancellationToken::new();
        let registry = SessionRegistry::new(4, 0).with_shutdown(shutdown.clone());
        let mut waiter = initiator(registry.join_or_create(id(1), 10).unwrap());
        registry.join_or_create(id(1), 20).unwrap();
        let cancel = waiter.joined.try_recv().unwrap().cancel;

        shutdown.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(4, 2);
        let _a = initiator(registry.join_or_create(id(1), 1).unwrap());
        let _b = initiator(registry.join_or_create(id(2), 2).unwrap());

        match registry.join_or_create(id(3), 3) {
            Err(Rejected {
                conn,
                error: RelayError::CapacityExhausted { max },
            }) => {
                assert_eq!(conn, 3);
                assert_eq!(max, 2);
            }
            _ => panic!("expected capacity rejection"),
        }

        // Pairing an existing session needs no extra room
        assert!(matches!(
            registry.join_or_create(id(1), 4),
            Ok(Join::Responder { .. })
        ));
    }

    #[test]
    fn test_concurrent_joins_yield_one_initiator() {
        for _ in 0..50 {
            let registry = Arc::new(SessionRegistry::new(4, 0));
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2u32)
                .map(|n| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        match registry.join_or_create(id(7), n) {
                            // Keep the waiter alive so the pair can form
                            Ok(Join::Initiator { waiter, .. }) => ("initiator", Some(waiter)),
                            Ok(Join::Responder { .. }) => ("responder", None),
                            Err(_) => ("rejected", None),
                        }
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let mut roles: Vec<_> = results.iter().map(|(role, _)| *role).collect();
            roles.sort_unstable();
            assert_eq!(roles, vec!["initiator", "responder"]);
            assert_eq!(registry.active_count(), 1);
        }
    }
}
