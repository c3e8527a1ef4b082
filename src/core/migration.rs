use crate::core::catalog::Catalog;
use crate::core::errors::*;
use crate::core::query::parse;
use crate::core::schema::{FieldDefinition, IndexDefinition, RelationSchema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// One schema change recorded by a migration's `up` or `down`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MigrationOperation {
    CreateTable {
        name: String,
        columns: Vec<FieldDefinition>,
        #[serde(default)]
        primary_key: Option<Vec<String>>,
    },
    DropTable {
        name: String,
    },
    AddColumn {
        table: String,
        column: FieldDefinition,
    },
    DropColumn {
        table: String,
        name: String,
    },
    CreateIndex {
        table: String,
        columns: Vec<String>,
        name: Option<String>,
        #[serde(default)]
        unique: bool,
    },
    DropIndex {
        name: String,
    },
    ExecuteSql {
        sql: String,
    },
}

impl MigrationOperation {
    pub fn name(&self) -> &'static str {
        match self {
            MigrationOperation::CreateTable { .. } => "create_table",
            MigrationOperation::DropTable { .. } => "drop_table",
            MigrationOperation::AddColumn { .. } => "add_column",
            MigrationOperation::DropColumn { .. } => "drop_column",
            MigrationOperation::CreateIndex { .. } => "create_index",
            MigrationOperation::DropIndex { .. } => "drop_index",
            MigrationOperation::ExecuteSql { .. } => "execute_sql",
        }
    }

    /// Applies the change to an in-memory catalog. `ExecuteSql` only parses the
    /// statement.
    pub fn apply_to(&self, catalog: &mut Catalog) -> Result<()> {
        match self {
            MigrationOperation::CreateTable { name, columns, primary_key } => {
                let mut schema = RelationSchema::new(name.clone(), columns.clone());
                schema.primary_key = primary_key.clone();
                catalog.register_relation(name, schema)
            }
            MigrationOperation::DropTable { name } => catalog.drop_relation(name).map(|_| ()),
            MigrationOperation::AddColumn { table, column } => catalog.add_column(table, column.clone()),
            MigrationOperation::DropColumn { table, name } => catalog.drop_column(table, name).map(|_| ()),
            MigrationOperation::CreateIndex { table, columns, name, unique } => {
                catalog.create_index(Self::index_definition(table, columns, name.as_deref(), *unique))
            }
            MigrationOperation::DropIndex { name } => catalog.drop_index(name).map(|_| ()),
            MigrationOperation::ExecuteSql { sql } => parse(sql).map(|_| ()),
        }
    }

    fn index_definition(table: &str, columns: &[String], name: Option<&str>, unique: bool) -> IndexDefinition {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| IndexDefinition::default_name(table, columns));
        let mut index = IndexDefinition::new(name, table, columns.to_vec());
        index.unique = unique;
        index
    }
}

/// Records operations; nothing runs until a runner hands them to a `SchemaExecutor`.
#[derive(Debug, Default)]
pub struct MigrationBuilder {
    operations: Vec<MigrationOperation>,
}

impl MigrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&mut self, name: &str, columns: Vec<FieldDefinition>) -> &mut Self {
        self.operations.push(MigrationOperation::CreateTable {
            name: name.to_string(),
            columns,
            primary_key: None,
        });
        self
    }

    pub fn create_table_with_key(
        &mut self,
        name: &str,
        columns: Vec<FieldDefinition>,
        primary_key: Vec<&str>,
    ) -> &mut Self {
        self.operations.push(MigrationOperation::CreateTable {
            name: name.to_string(),
            columns,
            primary_key: Some(primary_key.into_iter().map(str::to_string).collect()),
        });
        self
    }

    pub fn drop_table(&mut self, name: &str) -> &mut Self {
        self.operations.push(MigrationOperation::DropTable { name: name.to_string() });
        self
    }

    pub fn add_column(&mut self, table: &str, column: FieldDefinition) -> &mut Self {
        self.operations.push(MigrationOperation::AddColumn {
            table: table.to_string(),
            column,
        });
        self
    }

    pub fn drop_column(&mut self, table: &str, name: &str) -> &mut Self {
        self.operations.push(MigrationOperation::DropColumn {
            table: table.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn create_index(&mut self, table: &str, columns: &[&str], name: Option<&str>, unique: bool) -> &mut Self {
        self.operations.push(MigrationOperation::CreateIndex {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            name: name.map(str::to_string),
            unique,
        });
        self
    }

    pub fn drop_index(&mut self, name: &str) -> &mut Self {
        self.operations.push(MigrationOperation::DropIndex { name: name.to_string() });
        self
    }

    pub fn execute_sql(&mut self, sql: &str) -> &mut Self {
        self.operations.push(MigrationOperation::ExecuteSql { sql: sql.to_string() });
        self
    }

    pub fn operations(&self) -> &[MigrationOperation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<MigrationOperation> {
        self.operations
    }
}

pub trait Migration: Send + Sync {
    fn id(&self) -> &str;

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn up(&self, m: &mut MigrationBuilder) -> Result<()>;

    fn down(&self, m: &mut MigrationBuilder) -> Result<()>;
}

/// The storage side of a migration run.
pub trait SchemaExecutor {
    fn execute_operation(&self, operation: &MigrationOperation) -> Result<()>;
}

/// Catalog-only execution, for runs without a storage engine behind them.
impl SchemaExecutor for RwLock<Catalog> {
    fn execute_operation(&self, operation: &MigrationOperation) -> Result<()> {
        let mut catalog = self.write()?;
        operation.apply_to(&mut catalog)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed(String),
    RolledBack,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RunnerState {
    statuses: BTreeMap<String, MigrationStatus>,
    /// Completed migrations in apply order.
    applied: Vec<String>,
}

impl RunnerState {
    fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&serde_json::to_vec_pretty(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
    state: RunnerState,
    state_path: Option<PathBuf>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
            state: RunnerState::default(),
            state_path: None,
        }
    }

    /// A runner whose statuses survive in `path`; a missing file starts fresh.
    pub fn with_state_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = RunnerState::load(&path)?;
        Ok(Self {
            migrations: Vec::new(),
            state,
            state_path: Some(path),
        })
    }

    pub fn register(&mut self, migration: Box<dyn Migration>) -> Result<()> {
        if self.migrations.iter().any(|m| m.id() == migration.id()) {
            return Err(Error::Other(format!("migration '{}' registered twice", migration.id())));
        }
        self.migrations.push(migration);
        Ok(())
    }

    pub fn status(&self, id: &str) -> Option<MigrationStatus> {
        if let Some(status) = self.state.statuses.get(id) {
            return Some(status.clone());
        }
        self.find(id).map(|_| MigrationStatus::Pending)
    }

    /// Completed migrations in the order they were applied.
    pub fn applied(&self) -> &[String] {
        &self.state.applied
    }

    fn find(&self, id: &str) -> Option<&dyn Migration> {
        self.migrations.iter().find(|m| m.id() == id).map(|m| m.as_ref())
    }

    fn is_completed(&self, id: &str) -> bool {
        matches!(self.state.statuses.get(id), Some(MigrationStatus::Completed))
    }

    fn set_status(&mut self, id: &str, status: MigrationStatus) -> Result<()> {
        self.state.statuses.insert(id.to_string(), status);
        if let Some(path) = &self.state_path {
            self.state.save(path)?;
        }
        Ok(())
    }

    /// Pending migrations in dependency order. Ties go to registration order.
    pub fn plan(&self) -> Result<Vec<String>> {
        let pending: Vec<usize> = (0..self.migrations.len())
            .filter(|&i| !self.is_completed(self.migrations[i].id()))
            .collect();
        let position: HashMap<&str, usize> = self
            .migrations
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id(), i))
            .collect();

        let mut indegree: HashMap<usize, usize> = pending.iter().map(|&i| (i, 0)).collect();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

        for &i in &pending {
            for dependency in self.migrations[i].dependencies() {
                let j = *position.get(dependency.as_str()).ok_or_else(|| Error::MigrationNotFound {
                    id: dependency.clone(),
                })?;
                if self.is_completed(&dependency) {
                    continue;
                }
                *indegree.entry(i).or_insert(0) += 1;
                dependents.entry(j).or_default().push(i);
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(pending.len());

        while let Some(i) = ready.pop_first() {
            order.push(self.migrations[i].id().to_string());
            for &dependent in dependents.get(&i).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(degree) = indegree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() < pending.len() {
            let stuck = pending
                .iter()
                .map(|&i| self.migrations[i].id().to_string())
                .filter(|id| !order.contains(id))
                .collect();
            return Err(Error::CyclicDependency { migrations: stuck });
        }

        Ok(order)
    }

    /// Records every planned migration's `up` operations without executing them.
    pub fn dry_run(&self) -> Result<BTreeMap<String, Vec<MigrationOperation>>> {
        let mut operations = BTreeMap::new();
        for id in self.plan()? {
            let migration = self.find(&id).ok_or_else(|| Error::MigrationNotFound { id: id.clone() })?;
            let mut builder = MigrationBuilder::new();
            migration.up(&mut builder)?;
            operations.insert(id, builder.into_operations());
        }
        Ok(operations)
    }

    /// Applies pending migrations in plan order, stopping after `target` when given.
    /// Returns the ids applied by this call.
    pub fn apply(&mut self, executor: &dyn SchemaExecutor, target: Option<&str>) -> Result<Vec<String>> {
        let mut plan = self.plan()?;
        if let Some(target) = target {
            if self.find(target).is_none() {
                return Err(Error::MigrationNotFound { id: target.to_string() });
            }
            match plan.iter().position(|id| id == target) {
                Some(at) => plan.truncate(at + 1),
                None => plan.clear(),
            }
        }

        let mut applied = Vec::with_capacity(plan.len());
        for id in plan {
            self.set_status(&id, MigrationStatus::Running)?;
            match self.run(&id, executor, true) {
                Ok(count) => {
                    self.state.applied.push(id.clone());
                    self.set_status(&id, MigrationStatus::Completed)?;
                    log::info!("applied migration {} ({} operations)", id, count);
                    applied.push(id);
                }
                Err(e) => {
                    log::warn!("migration {} failed: {}", id, e);
                    self.set_status(&id, MigrationStatus::Failed(e.to_string()))?;
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }

    /// Reverts completed migrations newest first until `target` (kept) or the
    /// beginning. Returns the ids rolled back.
    pub fn rollback(&mut self, executor: &dyn SchemaExecutor, target: Option<&str>) -> Result<Vec<String>> {
        if let Some(target) = target {
            if !self.state.applied.iter().any(|id| id == target) {
                return Err(Error::MigrationNotFound { id: target.to_string() });
            }
        }

        let mut rolled_back = Vec::new();
        while let Some(id) = self.state.applied.last().cloned() {
            if Some(id.as_str()) == target {
                break;
            }
            match self.run(&id, executor, false) {
                Ok(count) => {
                    self.state.applied.pop();
                    self.set_status(&id, MigrationStatus::RolledBack)?;
                    log::info!("rolled back migration {} ({} operations)", id, count);
                    rolled_back.push(id);
                }
                Err(e) => {
                    log::warn!("rollback of {} failed: {}", id, e);
                    self.set_status(&id, MigrationStatus::Failed(e.to_string()))?;
                    return Err(e);
                }
            }
        }
        Ok(rolled_back)
    }

    fn run(&self, id: &str, executor: &dyn SchemaExecutor, up: bool) -> Result<usize> {
        let migration = self.find(id).ok_or_else(|| Error::MigrationNotFound { id: id.to_string() })?;
        let mut builder = MigrationBuilder::new();
        if up {
            migration.up(&mut builder)?;
        } else {
            migration.down(&mut builder)?;
        }
        for operation in builder.operations() {
            log::debug!("migration {}: {}", id, operation.name());
            executor.execute_operation(operation)?;
        }
        Ok(builder.operations().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::FieldType;
    use tempfile::TempDir;

    struct TestMigration {
        id: String,
        dependencies: Vec<String>,
        up: Vec<MigrationOperation>,
        down: Vec<MigrationOperation>,
    }

    impl TestMigration {
        fn boxed(id: &str, dependencies: &[&str]) -> Box<Self> {
            Box::new(Self {
                id: id.to_string(),
                dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
                up: Vec::new(),
                down: Vec::new(),
            })
        }

        fn creating(id: &str, dependencies: &[&str], table: &str) -> Box<Self> {
            let mut migration = Self::boxed(id, dependencies);
            migration.up.push(MigrationOperation::CreateTable {
                name: table.to_string(),
                columns: vec![FieldDefinition::new("id", FieldType::Integer)],
                primary_key: None,
            });
            migration.down.push(MigrationOperation::DropTable { name: table.to_string() });
            migration
        }
    }

    impl Migration for TestMigration {
        fn id(&self) -> &str {
            &self.id
        }

        fn dependencies(&self) -> Vec<String> {
            self.dependencies.clone()
        }

        fn up(&self, m: &mut MigrationBuilder) -> Result<()> {
            m.operations.extend(self.up.iter().cloned());
            Ok(())
        }

        fn down(&self, m: &mut MigrationBuilder) -> Result<()> {
            m.operations.extend(self.down.iter().cloned());
            Ok(())
        }
    }

    #[test]
    fn test_plan_orders_dependencies() {
        let mut runner = MigrationRunner::new();
        runner.register(TestMigration::boxed("a", &["b"])).unwrap();
        runner.register(TestMigration::boxed("b", &["c"])).unwrap();
        runner.register(TestMigration::boxed("c", &[])).unwrap();
        runner.register(TestMigration::boxed("d", &[])).unwrap();

        assert_eq!(runner.plan().unwrap(), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_plan_detects_cycle() {
        let mut runner = MigrationRunner::new();
        runner.register(TestMigration::boxed("a", &["b"])).unwrap();
        runner.register(TestMigration::boxed("b", &["c"])).unwrap();
        runner.register(TestMigration::boxed("c", &["a"])).unwrap();
        runner.register(TestMigration::boxed("free", &[])).unwrap();

        match runner.plan().unwrap_err() {
            Error::CyclicDependency { migrations } => {
                assert_eq!(migrations, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let mut runner = MigrationRunner::new();
        runner.register(TestMigration::boxed("a", &["ghost"])).unwrap();
        assert!(matches!(runner.plan(), Err(Error::MigrationNotFound { .. })));
        assert!(runner.register(TestMigration::boxed("a", &[])).is_err());
    }

    #[test]
    fn test_builder_records_operations() {
        let mut m = MigrationBuilder::new();
        m.create_table_with_key("events", vec![FieldDefinition::new("id", FieldType::Integer).not_null()], vec!["id"])
            .add_column("events", FieldDefinition::new("payload", FieldType::String))
            .create_index("events", &["payload"], None, false)
            .drop_index("idx_events_payload")
            .drop_column("events", "payload")
            .execute_sql("SELECT * FROM events")
            .drop_table("events");

        let names: Vec<&str> = m.operations().iter().map(MigrationOperation::name).collect();
        assert_eq!(
            names,
            vec!["create_table", "add_column", "create_index", "drop_index", "drop_column", "execute_sql", "drop_table"]
        );

        let catalog = RwLock::new(Catalog::new());
        for op in m.operations() {
            catalog.execute_operation(op).unwrap();
        }
        assert!(!catalog.read().unwrap().contains("events"));
    }

    #[test]
    fn test_dry_run_executes_nothing() {
        let mut runner = MigrationRunner::new();
        runner.register(TestMigration::creating("one", &[], "events")).unwrap();

        let ops = runner.dry_run().unwrap();
        assert_eq!(ops["one"].len(), 1);
        assert_eq!(runner.status("one"), Some(MigrationStatus::Pending));
    }

    #[test]
    fn test_apply_and_rollback() {
        let catalog = RwLock::new(Catalog::new());
        let mut runner = MigrationRunner::new();
        runner.register(TestMigration::creating("m2", &["m1"], "sites")).unwrap();
        runner.register(TestMigration::creating("m1", &[], "cities")).unwrap();
        runner.register(TestMigration::creating("m3", &["m2"], "routes")).unwrap();

        assert_eq!(runner.apply(&catalog, Some("m2")).unwrap(), vec!["m1", "m2"]);
        assert_eq!(runner.status("m3"), Some(MigrationStatus::Pending));
        assert_eq!(runner.apply(&catalog, None).unwrap(), vec!["m3"]);
        assert_eq!(runner.applied(), &["m1", "m2", "m3"]);
        assert!(runner.plan().unwrap().is_empty());

        assert_eq!(runner.rollback(&catalog, Some("m1")).unwrap(), vec!["m3", "m2"]);
        assert_eq!(runner.status("m2"), Some(MigrationStatus::RolledBack));
        assert_eq!(runner.status("m1"), Some(MigrationStatus::Completed));
        assert_eq!(catalog.read().unwrap().relation_names(), vec!["cities"]);

        assert_eq!(runner.plan().unwrap(), vec!["m2", "m3"]);
    }

    #[test]
    fn test_failure_marks_failed() {
        let catalog = RwLock::new(Catalog::new());
        let mut runner = MigrationRunner::new();
        let mut broken = TestMigration::boxed("broken", &[]);
        broken.up.push(MigrationOperation::DropColumn {
            table: "missing".to_string(),
            name: "x".to_string(),
        });
        runner.register(broken).unwrap();

        assert!(runner.apply(&catalog, None).is_err());
        assert!(matches!(runner.status("broken"), Some(MigrationStatus::Failed(_))));
        assert!(runner.applied().is_empty());
    }

    #[test]
    fn test_state_file_resumes() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("migrations.json");
        let catalog = RwLock::new(Catalog::new());

        {
            let mut runner = MigrationRunner::with_state_file(&state).unwrap();
            runner.register(TestMigration::creating("m1", &[], "cities")).unwrap();
            runner.apply(&catalog, None).unwrap();
        }

        let mut runner = MigrationRunner::with_state_file(&state).unwrap();
        runner.register(TestMigration::creating("m1", &[], "cities")).unwrap();
        runner.register(TestMigration::creating("m2", &["m1"], "sites")).unwrap();
        assert_eq!(runner.plan().unwrap(), vec!["m2"]);
        assert_eq!(runner.apply(&catalog, None).unwrap(), vec!["m2"]);
    }
}
