pub mod core;

pub use core::{
    Catalog, CostEstimate, CostModel, EngineOptions, FieldConstraint, FieldDefinition, FieldType, IndexDefinition,
    IndexType, IsolationLevel, LockManager, LockMode, Migration, MigrationBuilder, MigrationOperation,
    MigrationRunner, MigrationStatus, PageStore, PlanKind, PlanNode, PlanVisualizer, QueryPlanner, Record,
    RelationSchema, SchemaExecutor, StatisticsSource, StorageEngine, Transaction, TransactionManager, TxState,
    WriteAheadLog,
};
pub use core::errors::{Error, Result};
pub use core::query::{parse, Statement};
