use crate::core::constants::TransactionID;
use crate::core::errors::*;
use crate::core::lock_manager::{AcquireOutcome, LockManager, LockMode};
use crate::core::log_record::LogRecord;
use crate::core::wal::WriteAheadLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Levels that take SHARED locks on read and validate the read set at prepare.
    pub fn locks_reads(&self) -> bool {
        *self >= IsolationLevel::RepeatableRead
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Preparing,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub resource_id: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct CommittedValue {
    value: Value,
    version: u64,
}

/// State shared by the manager and every transaction it hands out.
struct TxnShared {
    wal: Arc<WriteAheadLog>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
    committed: RwLock<HashMap<String, CommittedValue>>,
    active: Mutex<HashMap<TransactionID, IsolationLevel>>,
}

impl TxnShared {
    fn committed_version(&self, resource_id: &str) -> u64 {
        self.committed
            .read()
            .recover_poison()
            .get(resource_id)
            .map(|c| c.version)
            .unwrap_or(0)
    }

    fn publish<I>(&self, writes: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut committed = self.committed.write().recover_poison();
        for (resource_id, value) in writes {
            let version = committed.get(&resource_id).map(|c| c.version).unwrap_or(0) + 1;
            committed.insert(resource_id, CommittedValue { value, version });
        }
    }

    fn deregister(&self, txn_id: TransactionID) {
        self.active.lock().recover_poison().remove(&txn_id);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Transaction {
    id: TransactionID,
    isolation: IsolationLevel,
    state: TxState,
    /// resource -> committed version seen at first read
    read_set: HashMap<String, u64>,
    write_set: HashMap<String, Value>,
    log: Vec<WriteOp>,
    shared: Arc<TxnShared>,
}

impl Transaction {
    pub fn id(&self) -> TransactionID {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    pub fn read_set(&self) -> impl Iterator<Item = &str> {
        self.read_set.keys().map(String::as_str)
    }

    pub fn operations(&self) -> &[WriteOp] {
        &self.log
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(Error::TxNotActive { txn_id: self.id });
        }
        Ok(())
    }

    fn lock(&self, resource_id: &str, mode: LockMode) -> Result<()> {
        let outcome = self.shared.locks.acquire_detailed(
            self.id,
            resource_id,
            mode,
            self.shared.lock_timeout,
        );
        match outcome {
            AcquireOutcome::Granted => Ok(()),
            AcquireOutcome::Timeout => Err(Error::LockTimeout {
                txn_id: self.id,
                resource_id: resource_id.to_string(),
            }),
            AcquireOutcome::Deadlock => Err(Error::Deadlock {
                txn_id: self.id,
                resource_id: resource_id.to_string(),
            }),
        }
    }

    /// Returns this transaction's pending write for the resource, else the last
    /// committed value, else `value`.
    pub fn read(&mut self, resource_id: &str, value: Value) -> Result<Value> {
        self.ensure_active()?;

        if self.isolation.locks_reads() {
            self.lock(resource_id, LockMode::Shared)?;
        }

        if !self.read_set.contains_key(resource_id) {
            let version = self.shared.committed_version(resource_id);
            self.read_set.insert(resource_id.to_string(), version);
        }

        if let Some(pending) = self.write_set.get(resource_id) {
            return Ok(pending.clone());
        }

        let committed = self
            .shared
            .committed
            .read()
            .recover_poison()
            .get(resource_id)
            .map(|c| c.value.clone());

        Ok(committed.unwrap_or(value))
    }

    pub fn write(&mut self, resource_id: &str, old_value: Option<Value>, new_value: Value) -> Result<()> {
        self.ensure_active()?;
        self.lock(resource_id, LockMode::Exclusive)?;

        self.write_set.insert(resource_id.to_string(), new_value.clone());
        self.log.push(WriteOp {
            resource_id: resource_id.to_string(),
            old_value,
            new_value,
            timestamp: now_millis(),
        });

        Ok(())
    }

    /// Validates the read set and makes every logged write durable. `Ok(false)` means
    /// validation failed and nothing was logged.
    pub fn prepare(&mut self) -> Result<bool> {
        self.ensure_active()?;

        if self.isolation.locks_reads() {
            for (resource_id, seen) in &self.read_set {
                if self.shared.committed_version(resource_id) != *seen {
                    log::debug!("txn {} read set changed: {}", self.id, resource_id);
                    return Ok(false);
                }
            }
        }

        self.state = TxState::Preparing;

        for op in &self.log {
            let record = LogRecord::TxnWrite {
                txn_id: self.id,
                resource_id: op.resource_id.clone(),
                old_value: op.old_value.clone(),
                new_value: op.new_value.clone(),
                timestamp: op.timestamp,
            };
            self.shared.wal.append(&record.encode()?)?;
        }

        Ok(true)
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.state == TxState::Active {
            match self.prepare() {
                Ok(true) => {}
                Ok(false) => {
                    self.abort()?;
                    return Err(Error::TxConflict { txn_id: self.id });
                }
                Err(e) => {
                    let _ = self.abort();
                    return Err(e);
                }
            }
        }
        if self.state != TxState::Preparing {
            return Err(Error::TxNotActive { txn_id: self.id });
        }

        if !self.log.is_empty() {
            let record = LogRecord::TxnCommit { txn_id: self.id };
            if let Err(e) = record.encode().and_then(|data| self.shared.wal.append(&data)) {
                let _ = self.abort();
                return Err(e);
            }
        }

        self.shared.publish(self.write_set.drain());
        self.state = TxState::Committed;
        self.finish();

        log::debug!("txn {} committed {} writes", self.id, self.log.len());

        Ok(())
    }

    /// Discards pending writes; they never reach the committed table.
    pub fn abort(&mut self) -> Result<()> {
        match self.state {
            TxState::Committed | TxState::Aborted => {
                return Err(Error::TxNotActive { txn_id: self.id });
            }
            TxState::Preparing if !self.log.is_empty() => {
                let record = LogRecord::TxnAbort { txn_id: self.id };
                if let Err(e) = record.encode().and_then(|data| self.shared.wal.append(&data)) {
                    log::warn!("txn {} abort record not logged: {}", self.id, e);
                }
            }
            _ => {}
        }

        self.write_set.clear();
        self.state = TxState::Aborted;
        self.finish();

        log::debug!("txn {} aborted", self.id);

        Ok(())
    }

    fn finish(&mut self) {
        self.shared.locks.release(self.id, None);
        self.shared.deregister(self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(self.state, TxState::Active | TxState::Preparing) {
            let _ = self.abort();
        }
    }
}

/// Replays transaction records: writes are held per transaction and only surface
/// once that transaction's commit record is seen.
#[derive(Debug, Default)]
pub struct RecoveredTransactions {
    pending: HashMap<TransactionID, Vec<(String, Value)>>,
    committed: Vec<(String, Value)>,
    max_txn_id: TransactionID,
    pub committed_count: usize,
}

impl RecoveredTransactions {
    pub fn observe(&mut self, record: &LogRecord) {
        match record {
            LogRecord::TxnWrite { txn_id, resource_id, new_value, .. } => {
                self.max_txn_id = self.max_txn_id.max(*txn_id);
                self.pending
                    .entry(*txn_id)
                    .or_default()
                    .push((resource_id.clone(), new_value.clone()));
            }
            LogRecord::TxnCommit { txn_id } => {
                self.max_txn_id = self.max_txn_id.max(*txn_id);
                if let Some(writes) = self.pending.remove(txn_id) {
                    self.committed.extend(writes);
                    self.committed_count += 1;
                }
            }
            LogRecord::TxnAbort { txn_id } => {
                self.max_txn_id = self.max_txn_id.max(*txn_id);
                self.pending.remove(txn_id);
            }
            LogRecord::Insert { .. } => {}
        }
    }

    /// Transactions that logged writes but never committed or aborted.
    pub fn in_doubt(&self) -> usize {
        self.pending.len()
    }
}

pub struct TransactionManager {
    shared: Arc<TxnShared>,
    next_id: AtomicU64,
    default_isolation: IsolationLevel,
}

impl TransactionManager {
    pub fn new(
        wal: Arc<WriteAheadLog>,
        locks: Arc<LockManager>,
        lock_timeout: Duration,
        default_isolation: IsolationLevel,
    ) -> Self {
        Self {
            shared: Arc::new(TxnShared {
                wal,
                locks,
                lock_timeout,
                committed: RwLock::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(1),
            default_isolation,
        }
    }

    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let isolation = isolation.unwrap_or(self.default_isolation);

        self.shared.active.lock().recover_poison().insert(id, isolation);

        Transaction {
            id,
            isolation,
            state: TxState::Active,
            read_set: HashMap::new(),
            write_set: HashMap::new(),
            log: Vec::new(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `f` in a new transaction: commits when it returns `Ok`, aborts when it
    /// returns `Err`. The transaction is out of the active table on return either way.
    pub fn transaction<R, F>(&self, isolation: Option<IsolationLevel>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        let mut txn = self.begin(isolation);

        match f(&mut txn) {
            Ok(value) => {
                if matches!(txn.state, TxState::Active | TxState::Preparing) {
                    txn.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if matches!(txn.state, TxState::Active | TxState::Preparing) {
                    let _ = txn.abort();
                }
                Err(e)
            }
        }
    }

    pub fn active_transactions(&self) -> Vec<TransactionID> {
        let mut ids: Vec<_> = self.shared.active.lock().recover_poison().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn committed_value(&self, resource_id: &str) -> Option<Value> {
        self.shared
            .committed
            .read()
            .recover_poison()
            .get(resource_id)
            .map(|c| c.value.clone())
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.shared.locks
    }

    /// Publishes recovered commits and moves the id counter past every logged id.
    pub fn restore(&self, recovered: RecoveredTransactions) {
        self.next_id.fetch_max(recovered.max_txn_id + 1, Ordering::SeqCst);
        self.shared.publish(recovered.committed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::WAL_FILE;
    use serde_json::json;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> (TransactionManager, Arc<WriteAheadLog>) {
        let wal = Arc::new(WriteAheadLog::open(&dir.path().join(WAL_FILE), 0o644, true).unwrap());
        let locks = Arc::new(LockManager::default());
        let manager = TransactionManager::new(
            Arc::clone(&wal),
            locks,
            Duration::from_millis(50),
            IsolationLevel::ReadCommitted,
        );
        (manager, wal)
    }

    fn logged(wal: &WriteAheadLog) -> Vec<LogRecord> {
        let mut records = Vec::new();
        wal.replay(|entry| {
            records.push(LogRecord::decode(entry)?);
            Ok(())
        })
        .unwrap();
        records
    }

    #[test]
    fn test_commit_then_read_committed_value() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        let mut t1 = manager.begin(None);
        t1.write("r1", None, json!("a")).unwrap();
        t1.commit().unwrap();
        assert_eq!(t1.state(), TxState::Committed);

        let mut t2 = manager.begin(None);
        assert_eq!(t2.read("r1", Value::Null).unwrap(), json!("a"));
        t2.commit().unwrap();
    }

    #[test]
    fn test_read_prefers_own_pending_write() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        let mut txn = manager.begin(None);
        assert_eq!(txn.read("k", json!(0)).unwrap(), json!(0));
        txn.write("k", Some(json!(0)), json!(5)).unwrap();
        assert_eq!(txn.read("k", json!(0)).unwrap(), json!(5));
        assert_eq!(manager.committed_value("k"), None);
    }

    #[test]
    fn test_abort_discards_writes_and_releases_locks() {
        let dir = TempDir::new().unwrap();
        let (manager, wal) = manager(&dir);

        let mut txn = manager.begin(None);
        txn.write("r", None, json!(1)).unwrap();
        assert_eq!(manager.lock_manager().holders("r").len(), 1);

        txn.abort().unwrap();
        assert_eq!(manager.committed_value("r"), None);
        assert!(manager.lock_manager().holders("r").is_empty());
        assert!(manager.active_transactions().is_empty());
        assert!(logged(&wal).is_empty());

        assert!(matches!(txn.abort(), Err(Error::TxNotActive { .. })));
        assert!(matches!(txn.write("r", None, json!(2)), Err(Error::TxNotActive { .. })));
    }

    #[test]
    fn test_commit_logs_writes_then_commit_record() {
        let dir = TempDir::new().unwrap();
        let (manager, wal) = manager(&dir);

        let mut txn = manager.begin(None);
        txn.write("a", None, json!(1)).unwrap();
        txn.write("b", Some(json!(0)), json!(2)).unwrap();
        txn.commit().unwrap();

        let records = logged(&wal);
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], LogRecord::TxnWrite { resource_id, .. } if resource_id == "a"));
        assert!(matches!(&records[1], LogRecord::TxnWrite { old_value: Some(_), .. }));
        assert_eq!(records[2], LogRecord::TxnCommit { txn_id: txn.id() });
    }

    #[test]
    fn test_exclusive_write_blocks_other_writer() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        let mut t1 = manager.begin(None);
        t1.write("r", None, json!(1)).unwrap();

        let mut t2 = manager.begin(None);
        assert!(matches!(t2.write("r", None, json!(2)), Err(Error::LockTimeout { .. })));
    }

    #[test]
    fn test_repeatable_read_conflict_aborts_commit() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        let mut reader = manager.begin(Some(IsolationLevel::RepeatableRead));
        reader.read("r", Value::Null).unwrap();
        assert_eq!(manager.lock_manager().holders("r"), vec![(reader.id(), LockMode::Shared)]);

        // a commit that bypassed the lock table
        manager.shared.publish(vec![("r".to_string(), json!("changed"))]);

        reader.write("other", None, json!(1)).unwrap();
        assert!(matches!(reader.commit(), Err(Error::TxConflict { .. })));
        assert_eq!(reader.state(), TxState::Aborted);
        assert_eq!(manager.committed_value("other"), None);
    }

    #[test]
    fn test_drop_aborts_unfinished() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        {
            let mut txn = manager.begin(None);
            txn.write("r", None, json!(1)).unwrap();
            assert_eq!(manager.active_transactions().len(), 1);
        }

        assert!(manager.active_transactions().is_empty());
        assert!(manager.lock_manager().holders("r").is_empty());
        assert_eq!(manager.committed_value("r"), None);
    }

    #[test]
    fn test_scoped_transaction() {
        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);

        let id = manager
            .transaction(None, |txn| {
                txn.write("x", None, json!("ok"))?;
                Ok(txn.id())
            })
            .unwrap();
        assert!(id > 0);
        assert_eq!(manager.committed_value("x"), Some(json!("ok")));

        let result: Result<()> = manager.transaction(None, |txn| {
            txn.write("y", None, json!("never"))?;
            Err(Error::Other("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(manager.committed_value("y"), None);
        assert!(manager.active_transactions().is_empty());
    }

    #[test]
    fn test_recovery_publishes_only_committed() {
        let mut recovered = RecoveredTransactions::default();
        let write = |txn_id, resource: &str, value| LogRecord::TxnWrite {
            txn_id,
            resource_id: resource.to_string(),
            old_value: None,
            new_value: value,
            timestamp: 0,
        };

        recovered.observe(&write(1, "a", json!(1)));
        recovered.observe(&write(2, "b", json!(2)));
        recovered.observe(&LogRecord::TxnCommit { txn_id: 1 });
        recovered.observe(&write(3, "c", json!(3)));
        recovered.observe(&LogRecord::TxnAbort { txn_id: 3 });
        assert_eq!(recovered.committed_count, 1);
        assert_eq!(recovered.in_doubt(), 1);

        let dir = TempDir::new().unwrap();
        let (manager, _wal) = manager(&dir);
        manager.restore(recovered);

        assert_eq!(manager.committed_value("a"), Some(json!(1)));
        assert_eq!(manager.committed_value("b"), None);
        assert_eq!(manager.committed_value("c"), None);
        assert!(manager.begin(None).id() > 3);
    }
}
