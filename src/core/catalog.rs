use crate::core::errors::*;
use crate::core::schema::{validate_relation_name, FieldDefinition, IndexDefinition, RelationSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Registry of relation schemas, index manifests and per-relation statistics.
///
/// Persisted as one JSON document that is rewritten wholesale after every
/// schema mutation.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Catalog {
    pub relations: BTreeMap<String, RelationSchema>,
    #[serde(default)]
    pub indices: BTreeMap<String, Vec<IndexDefinition>>,
    #[serde(default)]
    pub statistics: BTreeMap<String, Map<String, Value>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Reads the catalog at `path`; a missing file is an empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(data) => Self::deserialize(&data),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&self.serialize()?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    pub fn contains(&self, relation: &str) -> bool {
        self.relations.contains_key(relation)
    }

    pub fn schema(&self, relation: &str) -> Result<&RelationSchema> {
        self.relations.get(relation).ok_or_else(|| Error::RelationNotFound {
            name: relation.to_string(),
        })
    }

    fn schema_mut(&mut self, relation: &str) -> Result<&mut RelationSchema> {
        self.relations.get_mut(relation).ok_or_else(|| Error::RelationNotFound {
            name: relation.to_string(),
        })
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.relations.keys().cloned().collect()
    }

    pub fn register_relation(&mut self, name: &str, mut schema: RelationSchema) -> Result<()> {
        validate_relation_name(name)?;
        if self.contains(name) {
            return Err(Error::RelationAlreadyExists { name: name.to_string() });
        }

        schema.name = name.to_string();
        schema.validate()?;

        self.relations.insert(name.to_string(), schema);
        self.indices.insert(name.to_string(), Vec::new());
        self.statistics.insert(name.to_string(), initial_statistics());

        Ok(())
    }

    pub fn drop_relation(&mut self, name: &str) -> Result<RelationSchema> {
        let schema = self.relations.remove(name).ok_or_else(|| Error::RelationNotFound {
            name: name.to_string(),
        })?;
        self.indices.remove(name);
        self.statistics.remove(name);
        Ok(schema)
    }

    pub fn add_column(&mut self, relation: &str, field: FieldDefinition) -> Result<()> {
        let schema = self.schema_mut(relation)?;

        if schema.field(&field.name).is_some() {
            return Err(Error::ColumnAlreadyExists {
                relation: relation.to_string(),
                column: field.name,
            });
        }
        let has_default = field.default.as_ref().map(|d| !d.is_null()).unwrap_or(false);
        if !field.nullable && !has_default {
            return Err(Error::SchemaValidation(format!(
                "non-nullable column '{}' added to '{}' needs a default for existing rows",
                field.name, relation
            )));
        }
        if let Some(default) = field.default.as_ref().filter(|d| !d.is_null()) {
            field.validate_value(default)?;
        }

        schema.fields.push(field);
        Ok(())
    }

    /// Removes a column and every index that references it.
    pub fn drop_column(&mut self, relation: &str, column: &str) -> Result<FieldDefinition> {
        let schema = self.schema_mut(relation)?;

        if schema.is_primary_key(column) {
            return Err(Error::SchemaValidation(format!(
                "cannot drop primary key column '{}' of '{}'",
                column, relation
            )));
        }
        let pos = schema.fields.iter().position(|f| f.name == column).ok_or_else(|| {
            Error::ColumnNotFound {
                relation: relation.to_string(),
                column: column.to_string(),
            }
        })?;
        let field = schema.fields.remove(pos);

        if let Some(indices) = self.indices.get_mut(relation) {
            indices.retain(|index| !index.references(column));
        }

        Ok(field)
    }

    pub fn create_index(&mut self, index: IndexDefinition) -> Result<()> {
        let schema = self.schema(&index.relation)?;

        if index.columns.is_empty() {
            return Err(Error::SchemaValidation(format!(
                "index '{}' must cover at least one column",
                index.name
            )));
        }
        for column in &index.columns {
            if schema.field(column).is_none() {
                return Err(Error::ColumnNotFound {
                    relation: index.relation.clone(),
                    column: column.clone(),
                });
            }
        }
        if self.find_index(&index.name).is_some() {
            return Err(Error::IndexAlreadyExists { name: index.name });
        }

        self.indices.entry(index.relation.clone()).or_default().push(index);
        Ok(())
    }

    pub fn drop_index(&mut self, name: &str) -> Result<IndexDefinition> {
        for indices in self.indices.values_mut() {
            if let Some(pos) = indices.iter().position(|index| index.name == name) {
                return Ok(indices.remove(pos));
            }
        }
        Err(Error::IndexNotFound { name: name.to_string() })
    }

    pub fn find_index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indices.values().flatten().find(|index| index.name == name)
    }

    pub fn indices_for(&self, relation: &str) -> &[IndexDefinition] {
        self.indices.get(relation).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn row_count(&self, relation: &str) -> u64 {
        self.statistics
            .get(relation)
            .and_then(|stats| stats.get("row_count"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn record_insert(&mut self, relation: &str) {
        let rows = self.row_count(relation) + 1;
        self.statistics
            .entry(relation.to_string())
            .or_insert_with(initial_statistics)
            .insert("row_count".to_string(), Value::from(rows));
    }

    pub fn set_statistic(&mut self, relation: &str, key: &str, value: Value) {
        self.statistics
            .entry(relation.to_string())
            .or_insert_with(initial_statistics)
            .insert(key.to_string(), value);
    }
}

fn initial_statistics() -> Map<String, Value> {
    let mut stats = Map::new();
    stats.insert("row_count".to_string(), Value::from(0u64));
    stats
}
