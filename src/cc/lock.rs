//! Lock-based concurrency control (2PL with deadlock detection)
//!
//! The lock table maps each object to its entries: granted locks first,
//! then waiters in FIFO order of `wait_start`. Two read locks held by
//! distinct transactions are compatible; every other pairing conflicts.
//! The wait-for graph is rebuilt from the lock table on every check —
//! it is tiny, and staleness is a correctness hazard. A demoted upgrade
//! entry is a waiter like any other and appears in the graph.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::Row;

use super::{ActionKind, CcResponse, ConcurrencyControl, Tid, Transaction};

/// Type of lock for lock-based concurrency control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl LockMode {
    /// Read/read is the only compatible pairing
    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Read && other == LockMode::Read
    }
}

/// One entry in an object's lock list
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub object_id: String,
    pub tid: Tid,
    pub mode: LockMode,
    pub granted: bool,
    pub requested_at: Instant,
    pub wait_start: Option<Instant>,
}

impl LockEntry {
    fn new(object_id: &str, tid: Tid, mode: LockMode) -> Self {
        Self {
            object_id: object_id.to_string(),
            tid,
            mode,
            granted: false,
            requested_at: Instant::now(),
            wait_start: None,
        }
    }

    /// Whether a waiting entry has outlived the lock timeout
    pub fn is_expired(&self, timeout: Duration) -> bool {
        if self.granted {
            return false;
        }
        match self.wait_start {
            Some(start) => start.elapsed() > timeout,
            None => false,
        }
    }
}

/// Manages the lock table and the wait-for graph
pub struct LockManager {
    lock_table: HashMap<String, Vec<LockEntry>>,
    wait_for: HashMap<Tid, HashSet<Tid>>,
    timeout: Duration,
    /// Cycle recorded by the most recent successful deadlock detection
    last_detected_cycle: Vec<Tid>,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock_table: HashMap::new(),
            wait_for: HashMap::new(),
            timeout,
            last_detected_cycle: Vec::new(),
        }
    }

    /// Attempt to acquire a lock for a transaction on an object.
    pub fn acquire(&mut self, object_id: &str, tid: Tid, mode: LockMode) -> bool {
        let entries = self.lock_table.entry(object_id.to_string()).or_default();

        // Transactions whose granted locks conflict with this request
        let conflicting: HashSet<Tid> = entries
            .iter()
            .filter(|e| e.tid != tid && e.granted && !e.mode.compatible(mode))
            .map(|e| e.tid)
            .collect();

        if let Some(existing) = entries.iter_mut().find(|e| e.tid == tid) {
            if !existing.granted {
                // Already queued; the request stays pending
                return false;
            }
            // A write lock satisfies any request; a read lock satisfies a read
            if existing.mode == mode || existing.mode == LockMode::Write {
                return true;
            }
            // Read-to-write upgrade
            if conflicting.is_empty() {
                existing.mode = LockMode::Write;
                existing.requested_at = Instant::now();
                return true;
            }
            // Demote to waiting; the entry now queues for the write lock
            existing.granted = false;
            existing.mode = LockMode::Write;
            existing.wait_start = Some(Instant::now());
            return false;
        }

        let mut entry = LockEntry::new(object_id, tid, mode);
        if conflicting.is_empty() {
            entry.granted = true;
            entries.push(entry);
            true
        } else {
            entry.wait_start = Some(Instant::now());
            entries.push(entry);
            false
        }
    }

    /// Release every lock held or requested by a transaction, granting
    /// compatible waiters on each touched object. Returns the objects the
    /// transaction released.
    pub fn release_all(&mut self, tid: Tid) -> Vec<String> {
        let mut released = Vec::new();
        let objects: Vec<String> = self.lock_table.keys().cloned().collect();

        for object_id in objects {
            let entries = match self.lock_table.get_mut(&object_id) {
                Some(entries) => entries,
                None => continue,
            };
            let before = entries.len();
            entries.retain(|e| e.tid != tid);
            if entries.len() != before {
                released.push(object_id.clone());
                self.grant_waiters(&object_id);
                if self
                    .lock_table
                    .get(&object_id)
                    .map(|v| v.is_empty())
                    .unwrap_or(false)
                {
                    self.lock_table.remove(&object_id);
                }
            }
        }

        self.wait_for.remove(&tid);
        released
    }

    /// Grant waiters on an object: walk them in FIFO order of wait start,
    /// grant each whose mode is compatible with every currently granted
    /// holder, and stop after the first write grant.
    fn grant_waiters(&mut self, object_id: &str) {
        let entries = match self.lock_table.get_mut(object_id) {
            Some(entries) => entries,
            None => return,
        };

        let mut granted_modes: Vec<LockMode> = entries
            .iter()
            .filter(|e| e.granted)
            .map(|e| e.mode)
            .collect();

        let mut waiter_indices: Vec<usize> = (0..entries.len())
            .filter(|&i| !entries[i].granted)
            .collect();
        waiter_indices.sort_by_key(|&i| entries[i].wait_start);

        for i in waiter_indices {
            let mode = entries[i].mode;
            if granted_modes.iter().all(|g| g.compatible(mode)) {
                entries[i].granted = true;
                entries[i].wait_start = None;
                granted_modes.push(mode);
                if mode == LockMode::Write {
                    break;
                }
            }
        }
    }

    /// Whether a request would conflict with a granted lock held by
    /// another transaction
    pub fn check_conflict(&self, object_id: &str, tid: Tid, mode: LockMode) -> bool {
        self.lock_table
            .get(object_id)
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.granted && e.tid != tid && !e.mode.compatible(mode))
            })
            .unwrap_or(false)
    }

    /// The waiting entry for an object/transaction pair, if any
    pub fn waiting_entry(&self, object_id: &str, tid: Tid) -> Option<&LockEntry> {
        self.lock_table
            .get(object_id)?
            .iter()
            .find(|e| e.tid == tid && !e.granted)
    }

    /// Drop an expired waiter so a timed-out statement does not linger in
    /// the queue
    pub fn drop_waiter(&mut self, object_id: &str, tid: Tid) {
        if let Some(entries) = self.lock_table.get_mut(object_id) {
            entries.retain(|e| e.granted || e.tid != tid);
            if entries.is_empty() {
                self.lock_table.remove(object_id);
            }
        }
    }

    /// Rebuild the wait-for graph and search it for a cycle.
    pub fn detect_deadlock(&mut self) -> bool {
        self.build_wait_for_graph();
        self.has_cycle()
    }

    /// The deadlock victim: the youngest transaction (largest tid) in the
    /// recorded cycle. Only meaningful after `detect_deadlock` returned
    /// true.
    pub fn deadlock_victim(&self) -> Option<Tid> {
        self.last_detected_cycle.iter().max().copied()
    }

    /// Rebuild the wait-for graph from scratch over the current lock
    /// table: for every object with waiters and granted holders, add an
    /// edge from each waiter to each conflicting holder other than itself.
    fn build_wait_for_graph(&mut self) {
        self.wait_for.clear();

        for entries in self.lock_table.values() {
            let granted: Vec<&LockEntry> = entries.iter().filter(|e| e.granted).collect();
            let waiting: Vec<&LockEntry> = entries.iter().filter(|e| !e.granted).collect();
            if granted.is_empty() || waiting.is_empty() {
                continue;
            }

            for waiter in &waiting {
                for holder in &granted {
                    if holder.tid == waiter.tid {
                        continue;
                    }
                    if !waiter.mode.compatible(holder.mode) {
                        self.wait_for
                            .entry(waiter.tid)
                            .or_default()
                            .insert(holder.tid);
                    }
                }
            }
        }
    }

    /// DFS with a recursion stack; the detected cycle is recorded for
    /// victim selection.
    fn has_cycle(&mut self) -> bool {
        self.last_detected_cycle.clear();
        let mut visited: HashSet<Tid> = HashSet::new();
        let mut stack: HashSet<Tid> = HashSet::new();
        let mut path: Vec<Tid> = Vec::new();

        let nodes: Vec<Tid> = self.wait_for.keys().copied().collect();
        for node in nodes {
            if !visited.contains(&node)
                && self.dfs(node, &mut visited, &mut stack, &mut path)
            {
                return true;
            }
        }
        false
    }

    fn dfs(
        &mut self,
        node: Tid,
        visited: &mut HashSet<Tid>,
        stack: &mut HashSet<Tid>,
        path: &mut Vec<Tid>,
    ) -> bool {
        visited.insert(node);
        stack.insert(node);
        path.push(node);

        let neighbors: Vec<Tid> = self
            .wait_for
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for neighbor in neighbors {
            if !visited.contains(&neighbor) {
                if self.dfs(neighbor, visited, stack, path) {
                    return true;
                }
            } else if stack.contains(&neighbor) {
                let start = path.iter().position(|&t| t == neighbor).unwrap_or(0);
                self.last_detected_cycle = path[start..].to_vec();
                return true;
            }
        }

        path.pop();
        stack.remove(&node);
        false
    }

    /// Granted entries on an object (test and diagnostic hook)
    pub fn granted(&self, object_id: &str) -> Vec<(Tid, LockMode)> {
        self.lock_table
            .get(object_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.granted)
                    .map(|e| (e.tid, e.mode))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every granted pair on every object is compatible (well-formedness
    /// invariant, asserted by tests after each mutation)
    pub fn is_well_formed(&self) -> bool {
        self.lock_table.values().all(|entries| {
            let granted: Vec<&LockEntry> = entries.iter().filter(|e| e.granted).collect();
            granted.iter().enumerate().all(|(i, a)| {
                granted
                    .iter()
                    .skip(i + 1)
                    .all(|b| a.tid == b.tid || a.mode.compatible(b.mode))
            })
        })
    }
}

/// Lock-based strategy: acquire on access, hold to commit/abort, detect
/// deadlocks when a request is denied and abort the youngest transaction
/// in the cycle.
pub struct LockBased {
    lock_manager: LockManager,
}

impl LockBased {
    pub fn new(timeout: Duration) -> Self {
        Self {
            lock_manager: LockManager::new(timeout),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }
}

impl ConcurrencyControl for LockBased {
    fn check_permission(&mut self, txn: &Transaction, row: &Row, action: ActionKind) -> CcResponse {
        let mode = match action {
            ActionKind::Read => LockMode::Read,
            ActionKind::Write => LockMode::Write,
        };
        let tid = txn.tid;
        let object_id = &row.object_id;

        if self.lock_manager.acquire(object_id, tid, mode) {
            return CcResponse::allow(format!(
                "{:?} lock on {} granted to transaction {}",
                mode, object_id, tid
            ));
        }

        if self.lock_manager.detect_deadlock() {
            let victim = self.lock_manager.deadlock_victim().unwrap_or(tid);
            if victim == tid {
                log::info!("deadlock: transaction {} chosen as victim", tid);
                self.lock_manager.release_all(tid);
                return CcResponse::deny(format!(
                    "Transaction {} aborted due to deadlock",
                    tid
                ));
            }
            return CcResponse::deny_waiting(format!(
                "Transaction {} must wait (deadlock detected, victim is {})",
                tid, victim
            ));
        }

        // No deadlock: report the wait, surfacing expiry as a plain denial
        let timeout = self.lock_manager.timeout;
        let expired = self
            .lock_manager
            .waiting_entry(object_id, tid)
            .map(|e| e.is_expired(timeout))
            .unwrap_or(false);
        if expired {
            self.lock_manager.drop_waiter(object_id, tid);
            return CcResponse::deny(format!(
                "Transaction {} timed out waiting for lock on {}",
                tid, object_id
            ));
        }

        CcResponse::deny_waiting(format!(
            "Transaction {} must wait for lock on {}",
            tid, object_id
        ))
    }

    fn commit(&mut self, txn: &Transaction) -> CcResponse {
        let released = self.lock_manager.release_all(txn.tid);
        log::debug!(
            "transaction {} committed, released {} lock(s)",
            txn.tid,
            released.len()
        );
        CcResponse::allow(format!("Transaction {} committed, locks released", txn.tid))
    }

    fn abort(&mut self, txn: &Transaction) -> CcResponse {
        let released = self.lock_manager.release_all(txn.tid);
        log::debug!(
            "transaction {} aborted, released {} lock(s)",
            txn.tid,
            released.len()
        );
        CcResponse::allow(format!("Transaction {} aborted, locks released", txn.tid))
    }
}
