use crate::core::constants::*;
use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

fn reserved_relation_names() -> HashSet<&'static str> {
    let mut set = HashSet::new();
    set.insert("_catalog");
    set.insert("_internal");
    set.insert("_system");
    set.insert("_migrations");
    set
}

pub fn validate_relation_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::RelationNameEmpty);
    }

    if name.len() > MAX_RELATION_NAME_LEN {
        return Err(Error::RelationNameTooLong);
    }

    let first_char = name.chars().next()
        .ok_or(Error::RelationNameEmpty)?;
    if !first_char.is_alphabetic() && first_char != '_' {
        return Err(Error::RelationNameInvalidStart);
    }

    for ch in name.chars() {
        if !ch.is_alphanumeric() && ch != '_' {
            return Err(Error::RelationNameInvalidChar);
        }
    }

    if reserved_relation_names().contains(name) {
        return Err(Error::RelationNameReserved);
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Integer,
    Float,
    String,
    Boolean,
    /// Seconds since the unix epoch.
    Timestamp,
    Uuid,
    Curvature,
    /// Coordinate vector.
    Geodesic,
    HyperbolicPoint,
}

impl FieldType {
    /// Tag written in front of each packed value.
    pub fn tag(self) -> u8 {
        match self {
            FieldType::Integer => 1,
            FieldType::Float => 2,
            FieldType::String => 3,
            FieldType::Boolean => 4,
            FieldType::Timestamp => 5,
            FieldType::Uuid => 6,
            FieldType::Curvature => 7,
            FieldType::Geodesic => 8,
            FieldType::HyperbolicPoint => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(FieldType::Integer),
            2 => Ok(FieldType::Float),
            3 => Ok(FieldType::String),
            4 => Ok(FieldType::Boolean),
            5 => Ok(FieldType::Timestamp),
            6 => Ok(FieldType::Uuid),
            7 => Ok(FieldType::Curvature),
            8 => Ok(FieldType::Geodesic),
            9 => Ok(FieldType::HyperbolicPoint),
            other => Err(Error::DataCorruption {
                details: format!("unknown field type tag {}", other),
            }),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, FieldType::Float | FieldType::Timestamp | FieldType::Curvature)
    }

    pub fn is_point(self) -> bool {
        matches!(self, FieldType::Geodesic | FieldType::HyperbolicPoint)
    }
}

/// A named check on a single field value. Each carries the message reported on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldConstraint {
    Minimum { value: f64, message: String },
    Maximum { value: f64, message: String },
    MinLength { value: usize, message: String },
    MaxLength { value: usize, message: String },
    OneOf { values: Vec<Value>, message: String },
}

impl FieldConstraint {
    pub fn message(&self) -> &str {
        match self {
            FieldConstraint::Minimum { message, .. }
            | FieldConstraint::Maximum { message, .. }
            | FieldConstraint::MinLength { message, .. }
            | FieldConstraint::MaxLength { message, .. }
            | FieldConstraint::OneOf { message, .. } => message,
        }
    }

    /// Values the constraint does not apply to (a length bound on a number, say) pass.
    pub fn is_satisfied_by(&self, value: &Value) -> bool {
        match self {
            FieldConstraint::Minimum { value: min, .. } => {
                value.as_f64().map(|v| v >= *min).unwrap_or(true)
            }
            FieldConstraint::Maximum { value: max, .. } => {
                value.as_f64().map(|v| v <= *max).unwrap_or(true)
            }
            FieldConstraint::MinLength { value: min, .. } => {
                value_len(value).map(|len| len >= *min).unwrap_or(true)
            }
            FieldConstraint::MaxLength { value: max, .. } => {
                value_len(value).map(|len| len <= *max).unwrap_or(true)
            }
            FieldConstraint::OneOf { values, .. } => values.contains(value),
        }
    }
}

fn value_len(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// CURVATURE only: values must be a multiple of this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<FieldConstraint>,
}

fn default_nullable() -> bool {
    true
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: true,
            default: None,
            precision: None,
            constraints: Vec::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_constraint(mut self, constraint: FieldConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    fn invalid(&self, value: &Value, reason: impl Into<String>) -> Error {
        Error::Validation {
            field: self.name.clone(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Checks a non-null value against type, precision and constraints.
    pub fn validate_value(&self, value: &Value) -> Result<()> {
        let type_ok = match self.field_type {
            FieldType::Integer => value.is_i64(),
            FieldType::Float | FieldType::Timestamp | FieldType::Curvature => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Uuid => value
                .as_str()
                .map(|s| uuid::Uuid::parse_str(s).is_ok())
                .unwrap_or(false),
            FieldType::Geodesic => is_coordinate_array(value, 1),
            FieldType::HyperbolicPoint => is_coordinate_array(value, 2),
        };
        if !type_ok {
            return Err(self.invalid(value, format!("expected {:?}", self.field_type)));
        }

        if self.field_type == FieldType::Curvature {
            if let (Some(step), Some(v)) = (self.precision, value.as_f64()) {
                if step > 0.0 {
                    let nearest = (v / step).round() * step;
                    if (v - nearest).abs() > CURVATURE_PRECISION_TOLERANCE {
                        return Err(self.invalid(
                            value,
                            format!("not a multiple of precision {}", step),
                        ));
                    }
                }
            }
        }

        for constraint in &self.constraints {
            if !constraint.is_satisfied_by(value) {
                return Err(self.invalid(value, constraint.message()));
            }
        }

        Ok(())
    }
}

fn is_coordinate_array(value: &Value, min_len: usize) -> bool {
    match value {
        Value::Array(items) => items.len() >= min_len && items.iter().all(Value::is_number),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(default = "default_curvature")]
    pub curvature: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub geodesic_constraints: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_curvature() -> f64 {
    DEFAULT_CURVATURE
}

impl RelationSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
            primary_key: None,
            curvature: DEFAULT_CURVATURE,
            geodesic_constraints: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_primary_key<S: Into<String>>(mut self, columns: Vec<S>) -> Self {
        self.primary_key = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_curvature(mut self, curvature: f64) -> Self {
        self.curvature = curvature;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key
            .as_ref()
            .map(|pk| pk.iter().any(|c| c == column))
            .unwrap_or(false)
    }

    /// Rejects duplicate fields, unknown key columns and defaults that fail their own field.
    pub fn validate(&self) -> Result<()> {
        validate_relation_name(&self.name)?;

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(Error::SchemaValidation(format!(
                    "relation '{}' has a field with an empty name",
                    self.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::SchemaValidation(format!(
                    "relation '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
            if let Some(default) = &field.default {
                if !default.is_null() {
                    field.validate_value(default)?;
                }
            }
        }

        if let Some(pk) = &self.primary_key {
            if pk.is_empty() {
                return Err(Error::SchemaValidation(format!(
                    "relation '{}' has an empty primary key",
                    self.name
                )));
            }
            for column in pk {
                if self.field(column).is_none() {
                    return Err(Error::ColumnNotFound {
                        relation: self.name.clone(),
                        column: column.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Btree,
    Geodesic,
    Hyperbolic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub relation: String,
    pub columns: Vec<String>,
    pub index_type: IndexType,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new<S: Into<String>>(
        name: impl Into<String>,
        relation: impl Into<String>,
        columns: Vec<S>,
    ) -> Self {
        Self {
            name: name.into(),
            relation: relation.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            index_type: IndexType::Btree,
            unique: false,
        }
    }

    /// `idx_<relation>_<col>_<col>`, used when a migration does not name its index.
    pub fn default_name(relation: &str, columns: &[String]) -> String {
        format!("idx_{}_{}", relation, columns.join("_"))
    }

    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(String::as_str)
    }

    pub fn references(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}
