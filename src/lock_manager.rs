//! Resource-keyed exclusive lock table with FIFO hand-off.
//!
//! Every resource has at most one holder. Contending transactions queue
//! behind the holder in arrival order; each queued waiter owns the receiving
//! half of a `tokio::sync::oneshot` channel. Releasing a transaction hands
//! each of its resources straight to the head waiter, recording the new
//! holder before the waiter is woken, so a resource is never observed free
//! while someone is queued on it.
//!
//! The table sits behind a single `std::sync::Mutex` that is never held
//! across an `.await`. A release and its wake-ups therefore happen in one
//! critical section, and no other acquire can interleave.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::models::{ResourceKey, TxId};

/// Outcome of a non-suspending lock request.
#[derive(Debug)]
pub enum Acquire {
    /// The resource was free and now belongs to the caller.
    Granted,
    /// The caller already held the resource; nothing changed.
    Reentrant,
    /// Another transaction holds the resource; the caller is queued.
    Queued(LockWait),
}

/// A queued lock request. Resolves once ownership has been handed over.
#[derive(Debug)]
pub struct LockWait {
    resource: ResourceKey,
    holder: TxId,
    wake: oneshot::Receiver<()>,
}

impl LockWait {
    /// Resource being waited on.
    #[must_use]
    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    /// Transaction that held the resource when the request was queued.
    #[must_use]
    pub fn holder(&self) -> TxId {
        self.holder
    }

    /// Suspend until the lock is handed over.
    ///
    /// Returns `false` only if the lock manager was dropped first.
    pub async fn granted(self) -> bool {
        self.wake.await.is_ok()
    }
}

/// Point-in-time view of one held resource.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockEntry {
    /// Locked resource.
    pub resource: ResourceKey,
    /// Current holder.
    pub holder: TxId,
    /// Queued transactions, head first.
    pub waiting: Vec<TxId>,
}

/// Point-in-time view of the whole lock table, sorted by resource.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Held resources.
    pub entries: Vec<LockEntry>,
}

struct Waiter {
    tx_id: TxId,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockTable {
    holders: HashMap<ResourceKey, TxId>,
    owned: HashMap<TxId, BTreeSet<ResourceKey>>,
    waiters: HashMap<ResourceKey, VecDeque<Waiter>>,
}

impl LockTable {
    fn grant(&mut self, resource: ResourceKey, tx_id: TxId) {
        self.owned.entry(tx_id).or_default().insert(resource.clone());
        self.holders.insert(resource, tx_id);
    }

    /// Pass `resource` to the first waiter still listening.
    fn hand_off(&mut self, resource: &ResourceKey) -> Option<TxId> {
        let queue = self.waiters.get_mut(resource)?;
        let mut next = None;
        while let Some(waiter) = queue.pop_front() {
            // A dropped receiver means the waiting flow went away.
            if waiter.wake.send(()).is_ok() {
                next = Some(waiter.tx_id);
                break;
            }
        }
        if queue.is_empty() {
            self.waiters.remove(resource);
        }
        if let Some(tx_id) = next {
            self.grant(resource.clone(), tx_id);
        }
        next
    }
}

/// Process-wide lock table shared by every session.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        // Critical sections never panic midway, so a poisoned table is intact.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant `resource` to `tx_id` if possible, otherwise enqueue a waiter.
    ///
    /// Never suspends. A queued request must be driven with
    /// [`LockWait::granted`]; dropping it forfeits the place in line.
    #[must_use]
    pub fn request(&self, resource: &ResourceKey, tx_id: TxId) -> Acquire {
        let mut table = self.table();
        match table.holders.get(resource).copied() {
            None => {
                table.grant(resource.clone(), tx_id);
                debug!(%resource, tx = %tx_id, "lock granted");
                Acquire::Granted
            }
            Some(holder) if holder == tx_id => Acquire::Reentrant,
            Some(holder) => {
                let (wake, rx) = oneshot::channel();
                let queue = table.waiters.entry(resource.clone()).or_default();
                queue.push_back(Waiter { tx_id, wake });
                info!(
                    %resource,
                    tx = %tx_id,
                    %holder,
                    position = queue.len(),
                    "lock contended, queued"
                );
                Acquire::Queued(LockWait {
                    resource: resource.clone(),
                    holder,
                    wake: rx,
                })
            }
        }
    }

    /// Acquire `resource` for `tx_id`, suspending until it is handed over.
    ///
    /// Never fails and never times out.
    pub async fn acquire(&self, resource: &ResourceKey, tx_id: TxId) {
        loop {
            match self.request(resource, tx_id) {
                Acquire::Granted | Acquire::Reentrant => return,
                Acquire::Queued(wait) => {
                    if wait.granted().await {
                        return;
                    }
                }
            }
        }
    }

    /// Release every resource held by `tx_id`, handing each one to its next
    /// waiter. Returns how many resources were released; zero for a
    /// transaction that holds nothing.
    pub fn release_all(&self, tx_id: TxId) -> usize {
        let mut table = self.table();
        let Some(resources) = table.owned.remove(&tx_id) else {
            return 0;
        };
        for resource in &resources {
            table.holders.remove(resource);
            match table.hand_off(resource) {
                Some(next) => info!(%resource, from = %tx_id, to = %next, "lock handed off"),
                None => debug!(%resource, tx = %tx_id, "lock released"),
            }
        }
        resources.len()
    }

    /// Current holder of `resource`.
    #[must_use]
    pub fn holder(&self, resource: &ResourceKey) -> Option<TxId> {
        self.table().holders.get(resource).copied()
    }

    /// Resources currently held by `tx_id`, in key order.
    #[must_use]
    pub fn held_by(&self, tx_id: TxId) -> Vec<ResourceKey> {
        self.table()
            .owned
            .get(&tx_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of requests queued on `resource`.
    #[must_use]
    pub fn queue_len(&self, resource: &ResourceKey) -> usize {
        self.table().waiters.get(resource).map_or(0, VecDeque::len)
    }

    /// Copy of the whole table for observers.
    #[must_use]
    pub fn snapshot(&self) -> LockSnapshot {
        let table = self.table();
        let mut entries: Vec<LockEntry> = table
            .holders
            .iter()
            .map(|(resource, holder)| LockEntry {
                resource: resource.clone(),
                holder: *holder,
                waiting: table
                    .waiters
                    .get(resource)
                    .map(|queue| queue.iter().map(|w| w.tx_id).collect())
                    .unwrap_or_default(),
            })
            .collect();
        entries.sort_by(|a, b| a.resource.cmp(&b.resource));
        LockSnapshot { entries }
    }
}
