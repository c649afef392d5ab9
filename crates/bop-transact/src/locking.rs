//! Pessimistic, non-blocking claims on paths and resources.
//!
//! A transaction claims every key it touches. A key already claimed by a
//! different transaction fails the claim with [`TransactError::Conflict`];
//! there is no waiting.

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::error::{TransactError, TransactResult};
use crate::ids::{NodeId, ResourceId};
use crate::rt_path::RtPath;

/// Owner of a set of claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Owner used by the collector for its short-lived directory claims.
    pub const COLLECTOR: TransactionId = TransactionId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Path(NodeId, RtPath),
    Resource(ResourceId),
}

impl Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Path(node, path) => write!(f, "path {node}{path}"),
            LockKey::Resource(resource) => write!(f, "resource {resource}"),
        }
    }
}

/// Process-wide map of claimed keys to their owning transaction.
#[derive(Debug)]
pub struct LockTable {
    owners: DashMap<LockKey, TransactionId>,
    next_id: AtomicU64,
}

impl Default for LockTable {
    fn default() -> Self {
        Self {
            owners: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Starts an empty claim set for a new transaction.
    pub fn begin(self: &Arc<Self>) -> TransactionLocks {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        TransactionLocks {
            table: self.clone(),
            id,
            held: Vec::new(),
        }
    }

    /// Claims `key` for `owner`. Returns `true` when the claim is new.
    fn claim(&self, owner: TransactionId, key: &LockKey) -> TransactResult<bool> {
        match self.owners.entry(key.clone()) {
            Entry::Occupied(existing) if *existing.get() == owner => Ok(false),
            Entry::Occupied(existing) => Err(TransactError::conflict(format!(
                "{key} is held by {}",
                existing.get()
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(owner);
                Ok(true)
            }
        }
    }

    fn release(&self, owner: TransactionId, key: &LockKey) -> bool {
        self.owners
            .remove_if(key, |_, current| *current == owner)
            .is_some()
    }

    /// Claims `key` for the collector if nobody holds it.
    pub fn try_lock(self: &Arc<Self>, key: LockKey) -> Option<CollectorClaim> {
        match self.claim(TransactionId::COLLECTOR, &key) {
            Ok(true) => Some(CollectorClaim {
                table: self.clone(),
                key,
            }),
            Ok(false) | Err(_) => None,
        }
    }

    pub fn owner(&self, key: &LockKey) -> Option<TransactionId> {
        self.owners.get(key).map(|owner| *owner)
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.owners.contains_key(key)
    }

    /// Number of keys currently claimed.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Claims held by one transaction; all of them are released on drop.
#[derive(Debug)]
pub struct TransactionLocks {
    table: Arc<LockTable>,
    id: TransactionId,
    held: Vec<LockKey>,
}

impl TransactionLocks {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn lock(&mut self, key: LockKey) -> TransactResult<()> {
        if self.table.claim(self.id, &key)? {
            trace!(txn = %self.id, %key, "claimed");
            self.held.push(key);
        }
        Ok(())
    }

    pub fn lock_path(&mut self, node: NodeId, path: &RtPath) -> TransactResult<()> {
        self.lock(LockKey::Path(node, path.clone()))
    }

    pub fn lock_resource(&mut self, resource: ResourceId) -> TransactResult<()> {
        self.lock(LockKey::Resource(resource))
    }

    pub fn holds(&self, key: &LockKey) -> bool {
        self.table.owner(key) == Some(self.id)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Releases every claim; returns how many were held.
    pub fn release_all(&mut self) -> usize {
        let released = self
            .held
            .drain(..)
            .filter(|key| self.table.release(self.id, key))
            .count();
        if released > 0 {
            trace!(txn = %self.id, released, "released claims");
        }
        released
    }
}

impl Drop for TransactionLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// A collector claim, released on drop.
#[derive(Debug)]
pub struct CollectorClaim {
    table: Arc<LockTable>,
    key: LockKey,
}

impl Drop for CollectorClaim {
    fn drop(&mut self) {
        self.table.release(TransactionId::COLLECTOR, &self.key);
    }
}
