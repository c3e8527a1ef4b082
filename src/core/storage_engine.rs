use crate::core::catalog::Catalog;
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::lock_manager::LockManager;
use crate::core::log_record::LogRecord;
use crate::core::migration::{MigrationOperation, SchemaExecutor};
use crate::core::page::PageType;
use crate::core::page_store::PageStore;
use crate::core::planner::{PlanNode, PlanVisualizer, QueryPlanner, StatisticsSource, TableStatistics};
use crate::core::record::{self, Record};
use crate::core::schema::{FieldDefinition, IndexDefinition, RelationSchema};
use crate::core::transaction::{IsolationLevel, Transaction, TransactionManager, RecoveredTransactions};
use crate::core::wal::WriteAheadLog;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_size: usize,
    pub file_permissions: u32,
    /// How long a transaction waits for a lock before giving up.
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
    /// fsync the WAL after every append.
    pub sync_on_append: bool,
    pub default_isolation: IsolationLevel,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            file_permissions: 0o644,
            lock_timeout: Duration::from_secs(5),
            lock_poll_interval: Duration::from_millis(1),
            sync_on_append: true,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl EngineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size < PAGE_HEADER_SIZE + RECORD_FRAME_SIZE + 1 {
            return Err(Error::InvalidOptions(format!(
                "page_size {} is below the minimum of {}",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidOptions(format!(
                "page_size {} exceeds the maximum of {}",
                self.page_size, MAX_PAGE_SIZE
            )));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(Error::InvalidOptions("lock_poll_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// A single-node engine over one data directory.
///
/// Every insert is logged to the WAL before it reaches a page; pages and the
/// catalog are flushed at checkpoints. Opening the directory replays whatever
/// the last checkpoint did not cover.
///
/// Lock order: catalog, then pages.
pub struct StorageEngine {
    dir: PathBuf,
    options: EngineOptions,
    pages: Mutex<PageStore>,
    catalog: RwLock<Catalog>,
    wal: Arc<WriteAheadLog>,
    txn_manager: TransactionManager,
    lock_file: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl StorageEngine {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(dir, EngineOptions::default())
    }

    pub fn open_with_options(dir: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);

        #[cfg(unix)]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(options.file_permissions)
            .open(&lock_path)?;

        #[cfg(not(unix))]
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::DatabaseAlreadyOpen)?;

        let catalog = Catalog::load(&dir.join(CATALOG_FILE))?;
        let pages = PageStore::open(&dir.join(PAGES_FILE), options.page_size, options.file_permissions)?;
        let wal = Arc::new(WriteAheadLog::open(
            &dir.join(WAL_FILE),
            options.file_permissions,
            options.sync_on_append,
        )?);

        let locks = Arc::new(LockManager::new(options.lock_poll_interval));
        let txn_manager = TransactionManager::new(
            Arc::clone(&wal),
            locks,
            options.lock_timeout,
            options.default_isolation,
        );

        let engine = Self {
            dir,
            options,
            pages: Mutex::new(pages),
            catalog: RwLock::new(catalog),
            wal,
            txn_manager,
            lock_file: Mutex::new(Some(lock_file)),
            closed: AtomicBool::new(false),
        };
        engine.recover()?;

        log::info!(
            "opened {} ({} relations, page_size={})",
            engine.dir.display(),
            engine.relations().len(),
            engine.options.page_size
        );

        Ok(engine)
    }

    /// Re-applies inserts past the checkpoint watermark and rebuilds the
    /// committed-resource table from transaction records.
    fn recover(&self) -> Result<()> {
        let watermark = self.wal.checkpoint_position()?;
        let mut recovered = RecoveredTransactions::default();
        let mut reapplied = 0usize;
        let mut skipped = 0usize;

        let entries = {
            let mut catalog = self.catalog.write()?;
            let mut pages = self.pages.lock()?;

            self.wal.replay_from(0, |position, payload| {
                let record = LogRecord::decode(payload)?;
                if let LogRecord::Insert { relation, curvature, record: packed } = &record {
                    if position >= watermark {
                        if catalog.contains(relation) {
                            let page_id = pages.select_target(relation, packed, *curvature)?;
                            pages.append_record(page_id, packed)?;
                            catalog.record_insert(relation);
                            reapplied += 1;
                        } else {
                            skipped += 1;
                        }
                    }
                }
                recovered.observe(&record);
                Ok(())
            })?
        };

        if skipped > 0 {
            log::warn!("recovery skipped {} inserts into relations that no longer exist", skipped);
        }
        if entries > 0 {
            log::info!(
                "recovery replayed {} WAL entries: {} inserts re-applied, {} transactions committed, {} in doubt",
                entries,
                reapplied,
                recovered.committed_count,
                recovered.in_doubt()
            );
        }

        self.txn_manager.restore(recovered);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::DatabaseClosed);
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn catalog_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    /// Flushes pages, rewrites the catalog file and moves the replay watermark
    /// to the WAL end. Callers hold the catalog lock and then the pages lock.
    fn persist(&self, catalog: &Catalog, pages: &mut PageStore) -> Result<WalPosition> {
        pages.flush()?;
        catalog.save(&self.catalog_path())?;
        self.wal.sync()?;
        let position = self.wal.end_position();
        self.wal.checkpoint(position)?;
        Ok(position)
    }

    /// Mutates the catalog and checkpoints. The catalog file never runs ahead of
    /// the watermark, so replay cannot count an insert twice.
    fn alter_catalog<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Catalog) -> Result<R>,
    {
        self.ensure_open()?;
        let mut catalog = self.catalog.write()?;
        let mut next = catalog.clone();
        let result = f(&mut next)?;
        let mut pages = self.pages.lock()?;
        self.persist(&next, &mut pages)?;
        *catalog = next;
        Ok(result)
    }

    pub fn create_relation(&self, name: &str, schema: RelationSchema) -> Result<()> {
        self.alter_catalog(|catalog| catalog.register_relation(name, schema))?;
        log::info!("created relation {}", name);
        Ok(())
    }

    /// Drops the relation and frees its pages, then checkpoints so its logged
    /// inserts are never replayed into a later relation of the same name.
    pub fn drop_relation(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut catalog = self.catalog.write()?;
        let mut next = catalog.clone();
        next.drop_relation(name)?;

        let mut pages = self.pages.lock()?;
        let freed = pages.free_relation(name)?;
        self.persist(&next, &mut pages)?;
        *catalog = next;

        log::info!("dropped relation {} ({} pages freed)", name, freed);
        Ok(())
    }

    pub fn add_column(&self, relation: &str, field: FieldDefinition) -> Result<()> {
        self.alter_catalog(|catalog| catalog.add_column(relation, field))
    }

    pub fn drop_column(&self, relation: &str, column: &str) -> Result<()> {
        self.alter_catalog(|catalog| catalog.drop_column(relation, column).map(|_| ()))
    }

    pub fn create_index(&self, index: IndexDefinition) -> Result<()> {
        self.alter_catalog(|catalog| catalog.create_index(index))
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.alter_catalog(|catalog| catalog.drop_index(name).map(|_| ()))
    }

    pub fn schema(&self, relation: &str) -> Result<RelationSchema> {
        self.catalog.read()?.schema(relation).cloned()
    }

    pub fn relations(&self) -> Vec<String> {
        self.catalog.read().recover_poison().relation_names()
    }

    pub fn indices(&self, relation: &str) -> Vec<IndexDefinition> {
        self.catalog.read().recover_poison().indices_for(relation).to_vec()
    }

    pub fn row_count(&self, relation: &str) -> Result<u64> {
        let catalog = self.catalog.read()?;
        catalog.schema(relation)?;
        Ok(catalog.row_count(relation))
    }

    /// Validates, packs and logs the record, then places it on a page of the
    /// relation tagged with the record's curvature. Returns the WAL position.
    pub fn insert(&self, relation: &str, record: &Record) -> Result<WalPosition> {
        self.ensure_open()?;
        let mut catalog = self.catalog.write()?;
        let schema = catalog.schema(relation)?;

        let normalized = record::normalize(schema, record)?;
        let curvature = normalized
            .get("curvature")
            .and_then(|v| v.as_f64())
            .unwrap_or(schema.curvature);
        let packed = record::pack(schema, &normalized)?;

        let mut pages = self.pages.lock()?;
        let page_id = pages.select_target(relation, &packed, curvature)?;

        let position = self.wal.append(
            &LogRecord::Insert {
                relation: relation.to_string(),
                curvature,
                record: packed.clone(),
            }
            .encode()?,
        )?;

        pages.append_record(page_id, &packed)?;
        catalog.record_insert(relation);

        log::debug!("insert into {} at wal position {} (page {})", relation, position, page_id);
        Ok(position)
    }

    /// Every record of the relation in page-chain order, optionally filtered.
    pub fn scan(&self, relation: &str, predicate: Option<&dyn Fn(&Record) -> bool>) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let catalog = self.catalog.read()?;
        let schema = catalog.schema(relation)?;
        let pages = self.pages.lock()?;

        let mut records = Vec::new();
        for page_id in pages.relation_pages(relation) {
            let page = pages.read(page_id)?;
            if page.header.page_type != PageType::Data {
                log::warn!("scan of {} skipped non-data page {}", relation, page_id);
                continue;
            }
            if !page.verify_checksum() {
                return Err(Error::Corruption {
                    component: "page_store".to_string(),
                    page_id,
                    details: "checksum does not match data region".to_string(),
                });
            }
            let unpacked = page
                .records()
                .and_then(|raw| raw.into_iter().map(|r| record::unpack(schema, r)).collect::<Result<Vec<_>>>());
            match unpacked {
                Ok(page_records) => records.extend(
                    page_records
                        .into_iter()
                        .filter(|record| predicate.map(|p| p(record)).unwrap_or(true)),
                ),
                Err(e) => log::warn!("scan of {} skipped page {}: {}", relation, page_id, e),
            }
        }
        Ok(records)
    }

    pub fn plan_query(&self, sql: &str) -> Result<PlanNode> {
        self.ensure_open()?;
        QueryPlanner::new(self).plan_sql(sql)
    }

    pub fn explain(&self, sql: &str) -> Result<String> {
        Ok(PlanVisualizer::explain(&self.plan_query(sql)?))
    }

    pub fn begin(&self, isolation: Option<IsolationLevel>) -> Result<Transaction> {
        self.ensure_open()?;
        Ok(self.txn_manager.begin(isolation))
    }

    pub fn transaction<R, F>(&self, isolation: Option<IsolationLevel>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        self.ensure_open()?;
        self.txn_manager.transaction(isolation, f)
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txn_manager
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.txn_manager.lock_manager()
    }

    /// Flushes pages and the catalog, then moves the replay watermark to the WAL end.
    pub fn checkpoint(&self) -> Result<WalPosition> {
        self.ensure_open()?;
        self.checkpoint_inner()
    }

    fn checkpoint_inner(&self) -> Result<WalPosition> {
        let catalog = self.catalog.read()?;
        let mut pages = self.pages.lock()?;
        let position = self.persist(&catalog, &mut pages)?;

        log::debug!("checkpoint at wal position {}", position);
        Ok(position)
    }

    /// Checkpoints and releases the directory lock. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.checkpoint_inner().and_then(|_| self.wal.close());

        if let Some(lock_file) = self.lock_file.lock().recover_poison().take() {
            let _ = FileExt::unlock(&lock_file);
        }

        log::info!("closed {}", self.dir.display());
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl StatisticsSource for StorageEngine {
    fn table_statistics(&self, table: &str) -> Option<TableStatistics> {
        let catalog = self.catalog.read().recover_poison();
        if !catalog.contains(table) {
            return None;
        }
        let pages = self.pages.lock().recover_poison();
        Some(TableStatistics {
            row_count: catalog.row_count(table),
            page_count: pages.page_count(table) as u64,
        })
    }

    fn indices(&self, table: &str) -> Vec<IndexDefinition> {
        StorageEngine::indices(self, table)
    }
}

impl SchemaExecutor for StorageEngine {
    fn execute_operation(&self, operation: &MigrationOperation) -> Result<()> {
        match operation {
            MigrationOperation::DropTable { name } => self.drop_relation(name),
            MigrationOperation::ExecuteSql { sql } => self.plan_query(sql).map(|_| ()),
            _ => self.alter_catalog(|catalog| operation.apply_to(catalog)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::FieldType;
    use serde_json::json;
    use tempfile::TempDir;

    fn events_schema() -> RelationSchema {
        RelationSchema::new(
            "events",
            vec![
                FieldDefinition::new("id", FieldType::Integer).not_null(),
                FieldDefinition::new("payload", FieldType::String),
                FieldDefinition::new("curvature", FieldType::Curvature),
            ],
        )
        .with_primary_key(vec!["id"])
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn small_pages() -> EngineOptions {
        EngineOptions {
            page_size: 512,
            sync_on_append: false,
            ..EngineOptions::default()
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(EngineOptions::default().validate().is_ok());
        let tiny = EngineOptions { page_size: 32, ..EngineOptions::default() };
        assert!(matches!(tiny.validate(), Err(Error::InvalidOptions(_))));
        let huge = EngineOptions { page_size: MAX_PAGE_SIZE * 2, ..EngineOptions::default() };
        assert!(matches!(huge.validate(), Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn test_insert_and_scan() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();

        for i in 0..3 {
            engine
                .insert("events", &record(json!({"id": i, "payload": format!("p{}", i)})))
                .unwrap();
        }

        let all = engine.scan("events", None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["curvature"], json!(null));

        let only_one = engine
            .scan("events", Some(&|r: &Record| r["payload"] == json!("p1")))
            .unwrap();
        assert_eq!(only_one.len(), 1);
        assert_eq!(engine.row_count("events").unwrap(), 3);
    }

    #[test]
    fn test_curvature_groups_pages() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();

        engine.insert("events", &record(json!({"id": 1, "curvature": -1.0}))).unwrap();
        engine.insert("events", &record(json!({"id": 2, "curvature": -0.5}))).unwrap();
        engine.insert("events", &record(json!({"id": 3, "curvature": -1.0}))).unwrap();

        assert_eq!(engine.table_statistics("events").unwrap().page_count, 2);
    }

    #[test]
    fn test_scan_skips_page_that_fails_to_unpack() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();
        engine.insert("events", &record(json!({"id": 1, "curvature": -1.0}))).unwrap();
        engine.insert("events", &record(json!({"id": 2, "curvature": 0.5}))).unwrap();

        {
            let mut pages = engine.pages.lock().unwrap();
            let first = pages.relation_pages("events")[0];
            pages.append_record(first, &[0xff, 0xff, 0x01]).unwrap();
        }

        let rows = engine.scan("events", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(2));
    }

    #[test]
    fn test_invalid_record_never_logged() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();
        let before = engine.wal.end_position();

        let err = engine.insert("events", &record(json!({"id": "one"}))).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        let err = engine.insert("events", &record(json!({"payload": "x"}))).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        let err = engine
            .insert("events", &record(json!({"id": 1, "payload": "x".repeat(1000)})))
            .unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { .. }));

        assert_eq!(engine.wal.end_position(), before);
        assert!(engine.scan("events", None).unwrap().is_empty());
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        assert!(matches!(StorageEngine::open(dir.path()), Err(Error::DatabaseAlreadyOpen)));

        engine.close().unwrap();
        engine.close().unwrap();
        assert!(matches!(engine.scan("events", None), Err(Error::DatabaseClosed)));
        StorageEngine::open(dir.path()).unwrap();
    }

    #[test]
    fn test_reopen_keeps_catalog_and_rows() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
            engine.create_relation("events", events_schema()).unwrap();
            engine.insert("events", &record(json!({"id": 7, "payload": "kept"}))).unwrap();
            engine.close().unwrap();
        }

        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        assert_eq!(engine.relations(), vec!["events"]);
        assert_eq!(engine.schema("events").unwrap(), events_schema());
        let rows = engine.scan("events", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["payload"], json!("kept"));
        assert_eq!(engine.row_count("events").unwrap(), 1);
    }

    #[test]
    fn test_drop_relation_frees_pages() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();
        engine.insert("events", &record(json!({"id": 1}))).unwrap();

        engine.drop_relation("events").unwrap();
        assert!(matches!(engine.scan("events", None), Err(Error::RelationNotFound { .. })));

        engine.create_relation("events", events_schema()).unwrap();
        engine.close().unwrap();
        drop(engine);

        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        assert!(engine.scan("events", None).unwrap().is_empty());
    }

    #[test]
    fn test_drop_relation_larger_than_header_slot() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
            engine.create_relation("events", events_schema()).unwrap();
            for i in 0..150 {
                engine
                    .insert("events", &record(json!({"id": i, "payload": "x".repeat(400)})))
                    .unwrap();
            }
            assert_eq!(engine.table_statistics("events").unwrap().page_count, 150);

            engine.drop_relation("events").unwrap();
            engine.create_relation("events", events_schema()).unwrap();
            engine.insert("events", &record(json!({"id": 1, "payload": "after"}))).unwrap();
            engine.checkpoint().unwrap();
            engine.close().unwrap();
        }

        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        let rows = engine.scan("events", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["payload"], json!("after"));
        assert_eq!(engine.pages.lock().unwrap().live_pages(), 1);
    }

    #[test]
    fn test_failed_schema_change_leaves_catalog_untouched() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();

        // A directory where the catalog temp file goes makes the save fail.
        let blocker = dir.path().join(format!("{}.tmp", CATALOG_FILE));
        fs::create_dir(&blocker).unwrap();

        let err = engine
            .add_column("events", FieldDefinition::new("label", FieldType::String))
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{:?}", err);
        assert_eq!(engine.schema("events").unwrap(), events_schema());
        assert!(engine.drop_relation("events").is_err());
        assert_eq!(engine.relations(), vec!["events"]);

        fs::remove_dir(&blocker).unwrap();
        engine
            .add_column("events", FieldDefinition::new("label", FieldType::String))
            .unwrap();
        assert!(engine.schema("events").unwrap().field("label").is_some());
    }

    #[test]
    fn test_plan_query_uses_live_statistics() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open_with_options(dir.path(), small_pages()).unwrap();
        engine.create_relation("events", events_schema()).unwrap();
        for i in 0..20 {
            engine.insert("events", &record(json!({"id": i}))).unwrap();
        }

        let plan = engine.plan_query("SELECT * FROM events").unwrap();
        assert_eq!(plan.estimated_rows(), 20.0);
        assert!(matches!(
            engine.plan_query("SELECT * FROM missing"),
            Err(Error::RelationNotFound { .. })
        ));
        assert!(engine.explain("SELECT id FROM events LIMIT 5").unwrap().starts_with("LIMIT 5"));
    }
}
