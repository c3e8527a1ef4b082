pub mod constants;
pub mod errors;
pub mod page;
pub mod page_store;
pub mod wal;
pub mod log_record;
pub mod schema;
pub mod record;
pub mod catalog;
pub mod lock_manager;
pub mod transaction;
pub mod query;
pub mod planner;
pub mod migration;
pub mod storage_engine;

pub use constants::*;
pub use catalog::Catalog;
pub use lock_manager::{AcquireOutcome, Lock, LockManager, LockMode};
pub use log_record::LogRecord;
pub use migration::{Migration, MigrationBuilder, MigrationOperation, MigrationRunner, MigrationStatus, SchemaExecutor};
pub use page::{Page, PageHeader, PageType};
pub use page_store::PageStore;
pub use planner::{CostEstimate, CostModel, PlanKind, PlanNode, PlanVisualizer, QueryPlanner, StatisticsSource};
pub use record::Record;
pub use schema::{FieldConstraint, FieldDefinition, FieldType, IndexDefinition, IndexType, RelationSchema};
pub use storage_engine::{EngineOptions, StorageEngine};
pub use transaction::{IsolationLevel, Transaction, TransactionManager, TxState};
pub use wal::WriteAheadLog;
