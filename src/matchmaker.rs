//! Waiting pool and the pairing loop.
//!
//! Pairing keeps a single pending slot outside the pool. Each step pops the
//! oldest waiting client and either parks it in the slot, swaps it for a
//! pending client that has since disconnected, discards it (disconnected, or
//! the same identity as the pending client), or pairs it with the pending
//! client. Liveness is checked against the registry at pairing time, so a
//! client that dropped while queued is never matched.
//!
//! The loop is woken through a [`Notify`]. `notify_one` holds at most one
//! permit, so any number of `add` calls between two iterations collapse into a
//! single re-check; that is enough because every iteration looks at the whole
//! pool state again and re-posts the wake while clients remain.

use crate::client::{Client, ClientRegistry};
use crate::protocol::ServerSignal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

/// Result of a single pairing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Nothing was waiting.
    Empty,
    /// The candidate took the empty pending slot.
    Pending { client_id: String },
    /// The pool was empty and the pending client had disconnected.
    Released { client_id: String },
    /// The pending client had disconnected and was replaced by the candidate.
    ReplacedStale { stale_id: String, client_id: String },
    /// The candidate had disconnected while queued.
    DiscardedStale { client_id: String },
    /// The candidate has the pending client's identity.
    DiscardedSelf { client_id: String },
    /// Both sides were notified.
    Matched { first: String, second: String },
    /// Only `survivor` was notified; `failed` is treated as dead.
    PartiallyMatched {
        survivor: String,
        failed: String,
        requeued: bool,
    },
    /// Neither notification could be written.
    Failed { first: String, second: String },
}

pub struct MatchMaker {
    pool: Mutex<VecDeque<Arc<Client>>>,
    wake: Notify,
    registry: Arc<ClientRegistry>,
    requeue_survivor: bool,
}

impl MatchMaker {
    pub fn new(registry: Arc<ClientRegistry>, requeue_survivor: bool) -> Self {
        Self {
            pool: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            registry,
            requeue_survivor,
        }
    }

    fn lock_pool(&self) -> MutexGuard<'_, VecDeque<Arc<Client>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `client` to the tail of the pool and wake the loop. A queued
    /// entry with the same identity is replaced in place.
    pub fn add(&self, client: Arc<Client>) {
        let replaced = {
            let mut pool = self.lock_pool();
            match pool.iter_mut().find(|queued| queued.id == client.id) {
                Some(slot) => {
                    *slot = client.clone();
                    true
                }
                None => {
                    pool.push_back(client.clone());
                    false
                }
            }
        };

        if replaced {
            info!(client_id = %client.id, conn_id = %client.conn_id, "Replaced queued entry for reconnected client");
        } else {
            info!(client_id = %client.id, conn_id = %client.conn_id, "Adding client to match queue");
        }

        self.wake.notify_one();
    }

    /// Drop `client` from the pool if it is still waiting. Idempotent.
    ///
    /// Always wakes the loop, since the client may be sitting in the pending
    /// slot instead of the pool.
    pub fn remove(&self, client: &Arc<Client>) -> bool {
        let removed = {
            let mut pool = self.lock_pool();
            match pool.iter().position(|queued| Arc::ptr_eq(queued, client)) {
                Some(index) => pool.remove(index).is_some(),
                None => false,
            }
        };
        if removed {
            info!(client_id = %client.id, "Removed client from match queue");
        }
        self.wake.notify_one();
        removed
    }

    pub fn waiting_len(&self) -> usize {
        self.lock_pool().len()
    }

    /// Identities currently in the pool, oldest first.
    pub fn waiting_ids(&self) -> Vec<String> {
        self.lock_pool().iter().map(|c| c.id.clone()).collect()
    }

    fn pop_next(&self) -> Option<Arc<Client>> {
        self.lock_pool().pop_front()
    }

    /// Run one pairing step against `pending`, the single slot held by the loop.
    pub async fn try_pair(&self, pending: &mut Option<Arc<Client>>) -> PairingOutcome {
        let Some(candidate) = self.pop_next() else {
            // Don't keep a departed client's socket alive until someone else shows up.
            if let Some(stale) = pending.take_if(|waiting| !self.registry.is_current(waiting)) {
                debug!(client_id = %stale.id, "Pending client went away, releasing");
                return PairingOutcome::Released {
                    client_id: stale.id.clone(),
                };
            }
            return PairingOutcome::Empty;
        };

        let Some(waiting) = pending.take() else {
            debug!(client_id = %candidate.id, "Client waiting for a partner");
            let client_id = candidate.id.clone();
            *pending = Some(candidate);
            return PairingOutcome::Pending { client_id };
        };

        if !self.registry.is_current(&waiting) {
            debug!(stale_id = %waiting.id, client_id = %candidate.id, "Pending client went away, replacing");
            let outcome = PairingOutcome::ReplacedStale {
                stale_id: waiting.id.clone(),
                client_id: candidate.id.clone(),
            };
            *pending = Some(candidate);
            return outcome;
        }

        if !self.registry.is_current(&candidate) {
            debug!(client_id = %candidate.id, "Queued client went away, discarding");
            *pending = Some(waiting);
            return PairingOutcome::DiscardedStale {
                client_id: candidate.id.clone(),
            };
        }

        if candidate.id == waiting.id {
            warn!(client_id = %candidate.id, "Refusing to match client with itself");
            *pending = Some(waiting);
            return PairingOutcome::DiscardedSelf {
                client_id: candidate.id.clone(),
            };
        }

        self.notify_match(waiting, candidate).await
    }

    /// Tell both sides about each other. The two writes are independent: one
    /// failing does not hold up or cancel the other.
    async fn notify_match(&self, first: Arc<Client>, second: Arc<Client>) -> PairingOutcome {
        info!(client1 = %first.id, client2 = %second.id, "Matching clients");

        let to_first = ServerSignal::Match(second.id.clone());
        let to_second = ServerSignal::Match(first.id.clone());
        let (first_result, second_result) =
            tokio::join!(first.send_json(&to_first), second.send_json(&to_second));

        if let Err(e) = &first_result {
            error!(client_id = %first.id, error = %e, "Failed to send match to client 1");
            self.drop_dead(&first);
        }
        if let Err(e) = &second_result {
            error!(client_id = %second.id, error = %e, "Failed to send match to client 2");
            self.drop_dead(&second);
        }

        match (first_result.is_ok(), second_result.is_ok()) {
            (true, true) => PairingOutcome::Matched {
                first: first.id.clone(),
                second: second.id.clone(),
            },
            (true, false) => self.handle_orphan(first, &second),
            (false, true) => self.handle_orphan(second, &first),
            (false, false) => PairingOutcome::Failed {
                first: first.id.clone(),
                second: second.id.clone(),
            },
        }
    }

    // A client that missed its match write is gone: unregister it and end its
    // session so the connection task tears it down.
    fn drop_dead(&self, client: &Arc<Client>) {
        self.registry.remove_if_current(client);
        client.evict();
    }

    /// The survivor already holds a match for a dead peer. By default it is
    /// left to time out on its own; with requeueing enabled it goes straight
    /// back into the pool.
    fn handle_orphan(&self, survivor: Arc<Client>, failed: &Arc<Client>) -> PairingOutcome {
        let requeued = self.requeue_survivor && self.registry.is_current(&survivor);
        if requeued {
            info!(client_id = %survivor.id, peer_id = %failed.id, "Requeueing client after failed match");
            self.add(survivor.clone());
        } else {
            warn!(client_id = %survivor.id, peer_id = %failed.id, "Client matched with unreachable peer");
        }
        PairingOutcome::PartiallyMatched {
            survivor: survivor.id.clone(),
            failed: failed.id.clone(),
            requeued,
        }
    }

    /// The pairing loop. Runs until `shutdown` fires or its sender is dropped.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        info!("Match maker started");
        let mut pending: Option<Arc<Client>> = None;

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => {
                    info!("Match maker stopping");
                    break;
                }
            }

            let outcome = self.try_pair(&mut pending).await;
            debug!(?outcome, "Pairing step");

            // Remaining clients can make progress right away.
            if self.waiting_len() > 0 {
                self.wake.notify_one();
            }
        }
    }
}
