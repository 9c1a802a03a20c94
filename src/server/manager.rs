//! The lock manager: per-resource FIFO queues, multi-resource grants, TTL
//! expiry, and per-connection ownership.
//!
//! All state lives in one [`LockTable`] behind a mutex, and every mutation
//! (acquire, release, extend, expiry, connection close) takes effect
//! atomically in the order the critical section is entered. Nothing inside
//! the critical section blocks on I/O or timers: replies travel over oneshot
//! channels and expiry timers are armed after the guard drops.
//!
//! An acquisition is appended to the tail of every requested resource queue
//! in ascending resource order and is granted once it is at the head of all
//! of them. Because every acquisition enqueues in the same canonical order,
//! two requests sharing any resource are totally ordered on their shared
//! queues, so no cycle of mutual waiting can form.

use crate::error::{LockstepError, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Identifier of a server-side client connection.
pub type ConnectionId = u64;

/// Lifecycle of a live lock entry. Release is terminal: a released entry is
/// removed from every index and its id is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Held,
}

/// One acquisition, waiting or held.
struct Entry {
    /// Public id, assigned when the entry is granted.
    lock_id: Option<String>,
    /// Requested resources, deduplicated, ascending order. Queues are
    /// appended and drained in this order.
    resources: Vec<String>,
    owner: ConnectionId,
    /// Lease duration given at acquire; the default for extends.
    ttl: Duration,
    state: EntryState,
    /// Reply handle while waiting.
    reply: Option<oneshot::Sender<String>>,
    /// Lease deadline while held. A timer firing before this instant is
    /// stale (the lease was extended since it was armed) and does nothing.
    expires_at: Option<Instant>,
}

/// A grant produced inside the critical section; the expiry timer is armed
/// after the guard drops.
struct GrantedLock {
    key: u64,
    lock_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct LockTable {
    /// Resource id -> FIFO queue of entry keys. Head is held or next to hold.
    queues: HashMap<String, VecDeque<u64>>,
    entries: HashMap<u64, Entry>,
    /// Public lock id -> entry key, held entries only.
    by_lock_id: HashMap<String, u64>,
    /// Live connections and the entries they own.
    connections: HashMap<ConnectionId, HashSet<u64>>,
}

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
    expired: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// Lock manager statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct LockManagerStats {
    /// Total locks granted.
    pub acquired: u64,
    /// Total locks released by their owner.
    pub released: u64,
    /// Total locks reclaimed by TTL expiry.
    pub expired: u64,
    /// Total acquisitions that hit their locking timeout.
    pub timed_out: u64,
    /// Total acquisitions cancelled by connection loss.
    pub cancelled: u64,
    /// Currently held locks.
    pub held_locks: usize,
    /// Currently waiting acquisitions.
    pub waiting_acquisitions: usize,
    /// Resources with a non-empty queue.
    pub resources_in_use: usize,
    /// Registered connections.
    pub connections: usize,
}

/// The lock manager.
pub struct LockManager {
    table: Mutex<LockTable>,
    next_key: AtomicU64,
    next_connection: AtomicU64,
    counters: Counters,
}

impl LockManager {
    /// Create a new lock manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(LockTable::default()),
            next_key: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    /// Register a connection and return its id. Entries can only be owned by
    /// registered connections.
    pub async fn register_connection(&self) -> ConnectionId {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock().await;
        table.connections.insert(id, HashSet::new());
        id
    }

    /// Tear down a connection: cancel its waiting acquisitions and release
    /// its held locks, then promote newly eligible waiters. The table is
    /// quiescent with respect to this connection when the call returns.
    pub async fn close_connection(self: &Arc<Self>, connection: ConnectionId) {
        let granted = {
            let mut table = self.table.lock().await;
            let Some(owned) = table.connections.remove(&connection) else {
                return;
            };

            let mut affected = BTreeSet::new();
            for key in owned {
                if let Some(entry) = table.entries.get(&key) {
                    match entry.state {
                        EntryState::Waiting => {
                            self.counters.cancelled.fetch_add(1, Ordering::Relaxed)
                        }
                        EntryState::Held => {
                            self.counters.released.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                    affected.extend(Self::remove_entry(&mut table, key));
                }
            }

            let affected: Vec<String> = affected.into_iter().collect();
            Self::wake(&mut table, &affected)
        };

        debug!(connection, "connection closed, locks reclaimed");
        self.arm_all(granted);
    }

    /// Acquire a lock on `resources`.
    ///
    /// Grants immediately when every queue is empty of earlier requests;
    /// otherwise waits up to `locking_timeout` seconds for promotion.
    pub async fn acquire(
        self: &Arc<Self>,
        connection: ConnectionId,
        resources: Vec<String>,
        ttl: f64,
        locking_timeout: f64,
    ) -> Result<String> {
        if resources.is_empty() {
            return Err(LockstepError::InvalidRequest(
                "resources must be non-empty".to_string(),
            ));
        }
        if resources.iter().any(|r| r.is_empty()) {
            return Err(LockstepError::InvalidRequest(
                "resource ids must be non-empty".to_string(),
            ));
        }
        if !(ttl > 0.0 && ttl.is_finite()) {
            return Err(LockstepError::InvalidRequest(
                "ttl must be positive".to_string(),
            ));
        }
        if !(locking_timeout >= 0.0 && locking_timeout.is_finite()) {
            return Err(LockstepError::InvalidRequest(
                "lockingTimeout must not be negative".to_string(),
            ));
        }

        // Deduplicate and order canonically; every acquisition appends to
        // its queues in the same order, which rules out wait cycles.
        let resources: Vec<String> = resources
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let receiver = {
            let mut table = self.table.lock().await;
            if !table.connections.contains_key(&connection) {
                return Err(LockstepError::Cancelled);
            }

            let mut entry = Entry {
                lock_id: None,
                resources,
                owner: connection,
                ttl: Duration::from_secs_f64(ttl),
                state: EntryState::Waiting,
                reply: None,
                expires_at: None,
            };

            for resource in &entry.resources {
                table
                    .queues
                    .entry(resource.clone())
                    .or_default()
                    .push_back(key);
            }

            let eligible = entry
                .resources
                .iter()
                .all(|r| table.queues[r].front() == Some(&key));

            if eligible {
                table.entries.insert(key, entry);
                table
                    .connections
                    .get_mut(&connection)
                    .expect("connection registered")
                    .insert(key);
                let granted = Self::grant(&mut table, key);
                let lock_id = granted.lock_id.clone();
                drop(table);
                trace!(lock_id = %lock_id, connection, "lock granted immediately");
                self.arm_all(vec![granted]);
                return Ok(lock_id);
            }

            let (tx, rx) = oneshot::channel();
            entry.reply = Some(tx);
            table.entries.insert(key, entry);
            table
                .connections
                .get_mut(&connection)
                .expect("connection registered")
                .insert(key);
            rx
        };

        match tokio::time::timeout(Duration::from_secs_f64(locking_timeout), receiver).await {
            // Promoted by a neighbour; the granter armed the expiry timer.
            Ok(Ok(lock_id)) => Ok(lock_id),
            // Reply handle dropped: the connection was closed while waiting.
            Ok(Err(_)) => Err(LockstepError::Cancelled),
            Err(_) => {
                let granted = {
                    let mut table = self.table.lock().await;
                    let current = table
                        .entries
                        .get(&key)
                        .map(|e| (e.state, e.lock_id.clone()));
                    match current {
                        Some((EntryState::Held, lock_id)) => {
                            // A grant raced the timeout; the grant wins.
                            return Ok(lock_id.expect("held entry has id"));
                        }
                        Some((EntryState::Waiting, _)) => {
                            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                            let affected = Self::remove_entry(&mut table, key);
                            Self::wake(&mut table, &affected)
                        }
                        // Granted and already reclaimed before we re-entered;
                        // the id is unrecoverable, treat as cancelled.
                        None => return Err(LockstepError::Cancelled),
                    }
                };
                trace!(connection, "lock acquisition timed out");
                self.arm_all(granted);
                Err(LockstepError::LockingTimeout)
            }
        }
    }

    /// Release a held lock.
    pub async fn release(
        self: &Arc<Self>,
        connection: ConnectionId,
        lock_id: &str,
    ) -> Result<()> {
        let granted = {
            let mut table = self.table.lock().await;
            let Some(&key) = table.by_lock_id.get(lock_id) else {
                return Err(LockstepError::UnknownLock(lock_id.to_string()));
            };
            if table.entries[&key].owner != connection {
                return Err(LockstepError::NotOwner(lock_id.to_string()));
            }

            let affected = Self::remove_entry(&mut table, key);
            Self::wake(&mut table, &affected)
        };

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        trace!(lock_id, connection, "lock released");
        self.arm_all(granted);
        Ok(())
    }

    /// Reset a held lock's deadline to `now + ttl`. The ttl defaults to the
    /// value given at acquire.
    pub async fn extend(
        self: &Arc<Self>,
        connection: ConnectionId,
        lock_id: &str,
        ttl: Option<f64>,
    ) -> Result<()> {
        if let Some(ttl) = ttl {
            if !(ttl > 0.0 && ttl.is_finite()) {
                return Err(LockstepError::InvalidRequest(
                    "ttl must be positive".to_string(),
                ));
            }
        }

        let (key, deadline) = {
            let mut table = self.table.lock().await;
            let Some(&key) = table.by_lock_id.get(lock_id) else {
                return Err(LockstepError::UnknownLock(lock_id.to_string()));
            };
            let entry = table.entries.get_mut(&key).expect("indexed entry exists");
            if entry.owner != connection {
                return Err(LockstepError::NotOwner(lock_id.to_string()));
            }

            let ttl = ttl.map(Duration::from_secs_f64).unwrap_or(entry.ttl);
            let deadline = Instant::now() + ttl;
            entry.expires_at = Some(deadline);
            (key, deadline)
        };

        trace!(lock_id, connection, "lock extended");
        self.arm_expiry(key, deadline);
        Ok(())
    }

    /// TTL expiry, fired by an armed timer. A stale firing (the lock was
    /// released, or extended so its deadline moved past this timer) is a
    /// no-op; the later timer armed by the extend takes over.
    async fn expire(self: Arc<Self>, key: u64) {
        let granted = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.entries.get(&key) else {
                return;
            };
            let live = entry.state == EntryState::Held
                && entry.expires_at.is_some_and(|deadline| Instant::now() >= deadline);
            if !live {
                return;
            }

            debug!(lock_id = entry.lock_id.as_deref().unwrap_or(""), "lock expired");
            // Count before waking so a promoted waiter observes the expiry.
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            let affected = Self::remove_entry(&mut table, key);
            Self::wake(&mut table, &affected)
        };

        self.arm_all(granted);
    }

    /// Get a statistics snapshot.
    pub async fn stats(&self) -> LockManagerStats {
        let table = self.table.lock().await;
        let held = table.by_lock_id.len();

        LockManagerStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            held_locks: held,
            waiting_acquisitions: table.entries.len() - held,
            resources_in_use: table.queues.len(),
            connections: table.connections.len(),
        }
    }

    /// Promote an entry to held: assign its id, set the deadline, answer the
    /// reply handle. Caller arms the expiry timer after the guard drops.
    fn grant(table: &mut LockTable, key: u64) -> GrantedLock {
        let lock_id = uuid::Uuid::new_v4().to_string();
        let entry = table.entries.get_mut(&key).expect("entry exists");

        let deadline = Instant::now() + entry.ttl;
        entry.state = EntryState::Held;
        entry.lock_id = Some(lock_id.clone());
        entry.expires_at = Some(deadline);

        if let Some(reply) = entry.reply.take() {
            // The waiter may have given up between promotion and delivery;
            // the timeout path recovers the id from the entry.
            let _ = reply.send(lock_id.clone());
        }

        table.by_lock_id.insert(lock_id.clone(), key);
        GrantedLock {
            key,
            lock_id,
            deadline,
        }
    }

    /// Remove an entry from every index. Returns its resources in ascending
    /// order, the candidates for [`Self::wake`]. Dropping the reply handle
    /// cancels a still-parked waiter.
    fn remove_entry(table: &mut LockTable, key: u64) -> Vec<String> {
        let Some(entry) = table.entries.remove(&key) else {
            return Vec::new();
        };

        for resource in &entry.resources {
            if let Some(queue) = table.queues.get_mut(resource) {
                if let Some(pos) = queue.iter().position(|&k| k == key) {
                    queue.remove(pos);
                }
                if queue.is_empty() {
                    table.queues.remove(resource);
                }
            }
        }

        if let Some(lock_id) = &entry.lock_id {
            table.by_lock_id.remove(lock_id);
        }
        if let Some(owned) = table.connections.get_mut(&entry.owner) {
            owned.remove(&key);
        }

        entry.resources
    }

    /// Re-examine the head of each affected queue and promote every waiter
    /// that is now at the head of all of its queues. `resources` must be in
    /// ascending order so promotion order is deterministic.
    fn wake(table: &mut LockTable, resources: &[String]) -> Vec<GrantedLock> {
        let mut granted = Vec::new();
        for resource in resources {
            let Some(&head) = table.queues.get(resource).and_then(|q| q.front()) else {
                continue;
            };
            let eligible = match table.entries.get(&head) {
                Some(entry) => {
                    entry.state == EntryState::Waiting
                        && entry
                            .resources
                            .iter()
                            .all(|r| table.queues.get(r).and_then(|q| q.front()) == Some(&head))
                }
                None => false,
            };
            if eligible {
                granted.push(Self::grant(table, head));
            }
        }
        granted
    }

    /// Arm the expiry timer for a grant.
    fn arm_expiry(self: &Arc<Self>, key: u64, deadline: Instant) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            manager.expire(key).await;
        });
    }

    /// Arm timers and count grants produced by a wake pass.
    fn arm_all(self: &Arc<Self>, granted: Vec<GrantedLock>) {
        for grant in granted {
            self.counters.acquired.fetch_add(1, Ordering::Relaxed);
            self.arm_expiry(grant.key, grant.deadline);
        }
    }
}
