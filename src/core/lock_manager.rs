use crate::core::constants::TransactionID;
use crate::core::errors::PoisonedLockExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Lock compatibility, requester vs. holder from another transaction:
///
/// ```text
///          │ S  │ X  │ IS │ IX │
/// ─────────┼────┼────┼────┼────┤
///     S    │ ✓  │ ✗  │ ✓  │ ✗  │
///     X    │ ✗  │ ✗  │ ✗  │ ✗  │
///     IS   │ ✓  │ ✗  │ ✓  │ ✓  │
///     IX   │ ✗  │ ✗  │ ✓  │ ✓  │
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentShared,
    IntentExclusive,
}

impl LockMode {
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (Shared, Shared)
                | (Shared, IntentShared)
                | (IntentShared, Shared)
                | (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
        )
    }

    /// The weakest mode that grants everything either mode grants.
    pub fn stronger(self, other: LockMode) -> LockMode {
        use LockMode::*;
        match (self, other) {
            (Exclusive, _) | (_, Exclusive) => Exclusive,
            (IntentExclusive, Shared) | (Shared, IntentExclusive) => Exclusive,
            (Shared, _) | (_, Shared) => Shared,
            (IntentExclusive, _) | (_, IntentExclusive) => IntentExclusive,
            (IntentShared, IntentShared) => IntentShared,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
            LockMode::IntentShared => write!(f, "IS"),
            LockMode::IntentExclusive => write!(f, "IX"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lock {
    pub resource_id: String,
    pub mode: LockMode,
    pub holder: TransactionID,
    pub acquired_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Timeout,
    /// Waiting would close a cycle in the wait-for graph; the caller should abort.
    Deadlock,
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted)
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, Vec<Lock>>,
    /// waiter -> transactions holding what it is blocked on
    wait_for: HashMap<TransactionID, HashSet<TransactionID>>,
}

impl LockTable {
    /// Grants the lock or returns the transactions standing in the way.
    fn try_grant(
        &mut self,
        txn_id: TransactionID,
        resource_id: &str,
        mode: LockMode,
    ) -> std::result::Result<(), HashSet<TransactionID>> {
        let held = self.locks.entry(resource_id.to_string()).or_default();

        let blockers: HashSet<TransactionID> = held
            .iter()
            .filter(|lock| lock.holder != txn_id && !mode.is_compatible_with(&lock.mode))
            .map(|lock| lock.holder)
            .collect();
        if !blockers.is_empty() {
            return Err(blockers);
        }

        match held.iter_mut().find(|lock| lock.holder == txn_id) {
            Some(own) => own.mode = own.mode.stronger(mode),
            None => held.push(Lock {
                resource_id: resource_id.to_string(),
                mode,
                holder: txn_id,
                acquired_at: Instant::now(),
            }),
        }

        Ok(())
    }

    /// Returns the cycle through `start` if one exists.
    fn find_cycle(&self, start: TransactionID) -> Option<Vec<TransactionID>> {
        let mut visited = HashSet::new();
        let mut path = vec![start];
        if self.dfs_back_to(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_back_to(
        &self,
        current: TransactionID,
        start: TransactionID,
        visited: &mut HashSet<TransactionID>,
        path: &mut Vec<TransactionID>,
    ) -> bool {
        let next = match self.wait_for.get(&current) {
            Some(next) => next,
            None => return false,
        };

        for &holder in next {
            if holder == start {
                return true;
            }
            if !visited.insert(holder) {
                continue;
            }
            path.push(holder);
            if self.dfs_back_to(holder, start, visited, path) {
                return true;
            }
            path.pop();
        }

        false
    }

    fn forget_waiter(&mut self, txn_id: TransactionID) {
        self.wait_for.remove(&txn_id);
    }
}

/// Resource locks keyed by string id, with wait-for-graph deadlock detection.
///
/// Blocked requests poll: every attempt re-evaluates compatibility and the
/// wait-for graph under the table mutex, then sleeps `poll_interval`. Because
/// each attempt is atomic, of two transactions closing a cycle exactly one sees it.
pub struct LockManager {
    table: Mutex<LockTable>,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            poll_interval,
        }
    }

    pub fn acquire(
        &self,
        txn_id: TransactionID,
        resource_id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> bool {
        self.acquire_detailed(txn_id, resource_id, mode, timeout).is_granted()
    }

    pub fn acquire_detailed(
        &self,
        txn_id: TransactionID,
        resource_id: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;
        let mut attempts: u64 = 0;

        loop {
            {
                let mut table = self.table.lock().recover_poison();
                match table.try_grant(txn_id, resource_id, mode) {
                    Ok(()) => {
                        table.forget_waiter(txn_id);
                        return AcquireOutcome::Granted;
                    }
                    Err(blockers) => {
                        table.wait_for.insert(txn_id, blockers);
                        if let Some(cycle) = table.find_cycle(txn_id) {
                            table.forget_waiter(txn_id);
                            log::debug!(
                                "deadlock: txn {} requesting {} {:?}, cycle {:?}",
                                txn_id,
                                mode,
                                resource_id,
                                cycle
                            );
                            return AcquireOutcome::Deadlock;
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                self.table.lock().recover_poison().forget_waiter(txn_id);
                log::debug!(
                    "lock timeout: txn {} gave up on {} {:?} after {} attempts",
                    txn_id,
                    mode,
                    resource_id,
                    attempts + 1
                );
                return AcquireOutcome::Timeout;
            }

            attempts += 1;
            log::trace!("txn {} waiting for {} {:?} (attempt {})", txn_id, mode, resource_id, attempts);
            thread::sleep(self.poll_interval);
        }
    }

    /// Drops the transaction's locks on `resource_id`, or on everything when `None`,
    /// and removes it from the wait-for graph.
    pub fn release(&self, txn_id: TransactionID, resource_id: Option<&str>) {
        let mut table = self.table.lock().recover_poison();

        match resource_id {
            Some(resource_id) => {
                if let Some(held) = table.locks.get_mut(resource_id) {
                    held.retain(|lock| lock.holder != txn_id);
                    if held.is_empty() {
                        table.locks.remove(resource_id);
                    }
                }
            }
            None => {
                table.locks.retain(|_, held| {
                    held.retain(|lock| lock.holder != txn_id);
                    !held.is_empty()
                });
            }
        }

        table.wait_for.remove(&txn_id);
        for waits in table.wait_for.values_mut() {
            waits.remove(&txn_id);
        }
    }

    /// Changes the mode of a lock the transaction already holds. Fails when there is
    /// no such lock or another holder is incompatible with `new_mode`; never waits.
    pub fn escalate(&self, txn_id: TransactionID, resource_id: &str, new_mode: LockMode) -> bool {
        let mut table = self.table.lock().recover_poison();

        let held = match table.locks.get_mut(resource_id) {
            Some(held) => held,
            None => return false,
        };
        if !held.iter().any(|lock| lock.holder == txn_id) {
            return false;
        }
        let conflict = held
            .iter()
            .any(|lock| lock.holder != txn_id && !new_mode.is_compatible_with(&lock.mode));
        if conflict {
            return false;
        }

        for lock in held.iter_mut().filter(|lock| lock.holder == txn_id) {
            lock.mode = new_mode;
        }
        true
    }

    pub fn holders(&self, resource_id: &str) -> Vec<(TransactionID, LockMode)> {
        let table = self.table.lock().recover_poison();
        table
            .locks
            .get(resource_id)
            .map(|held| held.iter().map(|lock| (lock.holder, lock.mode)).collect())
            .unwrap_or_default()
    }

    pub fn locks_held_by(&self, txn_id: TransactionID) -> Vec<Lock> {
        let table = self.table.lock().recover_poison();
        table
            .locks
            .values()
            .flatten()
            .filter(|lock| lock.holder == txn_id)
            .cloned()
            .collect()
    }

    pub fn is_waiting(&self, txn_id: TransactionID) -> bool {
        self.table.lock().recover_poison().wait_for.contains_key(&txn_id)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(30);

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.is_compatible_with(&Shared));
        assert!(IntentShared.is_compatible_with(&IntentExclusive));
        assert!(IntentExclusive.is_compatible_with(&IntentShared));
        assert!(!Shared.is_compatible_with(&IntentExclusive));
        for mode in [Shared, Exclusive, IntentShared, IntentExclusive] {
            assert!(!Exclusive.is_compatible_with(&mode));
            assert!(!mode.is_compatible_with(&Exclusive));
        }
    }

    #[test]
    fn test_shared_locks_coexist_and_block_exclusive() {
        let manager = LockManager::default();
        assert!(manager.acquire(1, "r", LockMode::Shared, SHORT));
        assert!(manager.acquire(2, "r", LockMode::Shared, SHORT));
        assert_eq!(manager.holders("r").len(), 2);

        assert_eq!(
            manager.acquire_detailed(3, "r", LockMode::Exclusive, SHORT),
            AcquireOutcome::Timeout
        );
        assert!(!manager.is_waiting(3));
    }

    #[test]
    fn test_exclusive_is_exclusive() {
        let manager = LockManager::default();
        assert!(manager.acquire(1, "r", LockMode::Exclusive, SHORT));
        assert!(!manager.acquire(2, "r", LockMode::Exclusive, SHORT));
        assert!(!manager.acquire(2, "r", LockMode::Shared, SHORT));

        manager.release(1, Some("r"));
        assert!(manager.acquire(2, "r", LockMode::Exclusive, SHORT));
    }

    #[test]
    fn test_same_transaction_never_conflicts() {
        let manager = LockManager::default();
        assert!(manager.acquire(1, "r", LockMode::Shared, SHORT));
        assert!(manager.acquire(1, "r", LockMode::Exclusive, SHORT));
        assert_eq!(manager.holders("r"), vec![(1, LockMode::Exclusive)]);
    }

    #[test]
    fn test_release_all() {
        let manager = LockManager::default();
        manager.acquire(1, "a", LockMode::Exclusive, SHORT);
        manager.acquire(1, "b", LockMode::Shared, SHORT);
        assert_eq!(manager.locks_held_by(1).len(), 2);

        manager.release(1, None);
        assert!(manager.locks_held_by(1).is_empty());
        assert!(manager.holders("a").is_empty());
    }

    #[test]
    fn test_escalate() {
        let manager = LockManager::default();
        assert!(!manager.escalate(1, "r", LockMode::Exclusive));

        manager.acquire(1, "r", LockMode::Shared, SHORT);
        assert!(manager.escalate(1, "r", LockMode::Exclusive));
        assert_eq!(manager.holders("r"), vec![(1, LockMode::Exclusive)]);

        manager.acquire(2, "s", LockMode::Shared, SHORT);
        manager.acquire(3, "s", LockMode::Shared, SHORT);
        assert!(!manager.escalate(2, "s", LockMode::Exclusive));
    }

    #[test]
    fn test_waiter_granted_after_release() {
        let manager = Arc::new(LockManager::default());
        assert!(manager.acquire(1, "r", LockMode::Exclusive, SHORT));

        let waiter = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.acquire(2, "r", LockMode::Exclusive, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        manager.release(1, None);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_cycle_detected_in_table() {
        let mut table = LockTable::default();
        table.wait_for.insert(1, [2].into_iter().collect());
        table.wait_for.insert(2, [3].into_iter().collect());
        assert!(table.find_cycle(1).is_none());

        table.wait_for.insert(3, [1].into_iter().collect());
        assert_eq!(table.find_cycle(1), Some(vec![1, 2, 3]));

        // 4 waits on the cycle but is not part of it
        table.wait_for.insert(4, [1].into_iter().collect());
        assert!(table.find_cycle(4).is_none());
    }
}
