//! Record and operation models.
//!
//! Callers exchange plain JSON object maps with adapters. Work that has to cross an API
//! boundary (for example into a transaction) is described by an [`Operation`] value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// A stored row or document as a JSON object.
pub type Record = Map<String, JsonValue>;

/// Equality conditions. `null` matches a missing value; an empty map matches everything.
pub type Conditions = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Paging and ordering for `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }
}

fn default_soft() -> bool {
    true
}

/// A unit of work for [`execute_in_transaction`](crate::db::DatabaseAdapter::execute_in_transaction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Find {
        entity: String,
        #[serde(default)]
        conditions: Conditions,
        #[serde(default)]
        options: FindOptions,
    },
    FindOne {
        entity: String,
        #[serde(default)]
        conditions: Conditions,
    },
    Insert {
        entity: String,
        data: Record,
    },
    InsertMany {
        entity: String,
        records: Vec<Record>,
    },
    Update {
        entity: String,
        conditions: Conditions,
        data: Record,
    },
    Delete {
        entity: String,
        conditions: Conditions,
        #[serde(default = "default_soft")]
        soft: bool,
    },
    Count {
        entity: String,
        #[serde(default)]
        conditions: Conditions,
    },
    Aggregate {
        entity: String,
        pipeline: Vec<JsonValue>,
    },
}

impl Operation {
    pub fn entity(&self) -> &str {
        match self {
            Self::Find { entity, .. }
            | Self::FindOne { entity, .. }
            | Self::Insert { entity, .. }
            | Self::InsertMany { entity, .. }
            | Self::Update { entity, .. }
            | Self::Delete { entity, .. }
            | Self::Count { entity, .. }
            | Self::Aggregate { entity, .. } => entity,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::FindOne { .. } => "find_one",
            Self::Insert { .. } => "insert",
            Self::InsertMany { .. } => "insert_many",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Count { .. } => "count",
            Self::Aggregate { .. } => "aggregate",
        }
    }

    /// Value-free shape of the call, used to spot repeated queries.
    pub fn descriptor(&self) -> String {
        match self {
            Self::Find {
                entity,
                conditions,
                options,
            } => find_descriptor(entity, conditions, options),
            Self::FindOne { entity, conditions } => {
                condition_descriptor("find_one", entity, conditions)
            }
            Self::Insert { entity, data } => insert_descriptor(entity, data),
            Self::InsertMany { entity, records } => insert_many_descriptor(entity, records.len()),
            Self::Update {
                entity,
                conditions,
                data,
            } => update_descriptor(entity, conditions, data),
            Self::Delete {
                entity,
                conditions,
                soft,
            } => delete_descriptor(entity, conditions, *soft),
            Self::Count { entity, conditions } => condition_descriptor("count", entity, conditions),
            Self::Aggregate { entity, pipeline } => pipeline_descriptor(entity, pipeline),
        }
    }
}

fn keys(map: &Map<String, JsonValue>) -> String {
    let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(",")
}

pub(crate) fn condition_descriptor(operation: &str, entity: &str, conditions: &Conditions) -> String {
    if conditions.is_empty() {
        format!("{} {}", operation, entity)
    } else {
        format!("{} {} where [{}]", operation, entity, keys(conditions))
    }
}

pub(crate) fn insert_descriptor(entity: &str, data: &Record) -> String {
    format!("insert {} [{}]", entity, keys(data))
}

pub(crate) fn insert_many_descriptor(entity: &str, count: usize) -> String {
    format!("insert_many {} x{}", entity, count)
}

pub(crate) fn update_descriptor(entity: &str, conditions: &Conditions, data: &Record) -> String {
    format!(
        "{} set [{}]",
        condition_descriptor("update", entity, conditions),
        keys(data)
    )
}

pub(crate) fn delete_descriptor(entity: &str, conditions: &Conditions, soft: bool) -> String {
    let operation = if soft { "soft_delete" } else { "delete" };
    condition_descriptor(operation, entity, conditions)
}

pub(crate) fn find_descriptor(entity: &str, conditions: &Conditions, options: &FindOptions) -> String {
    let mut descriptor = condition_descriptor("find", entity, conditions);
    if !options.order_by.is_empty() {
        let order: Vec<String> = options
            .order_by
            .iter()
            .map(|o| format!("{} {}", o.field, o.direction.as_sql().to_lowercase()))
            .collect();
        descriptor.push_str(&format!(" order [{}]", order.join(",")));
    }
    if options.limit.is_some() {
        descriptor.push_str(" limit");
    }
    if options.offset.is_some() {
        descriptor.push_str(" offset");
    }
    descriptor
}

pub(crate) fn pipeline_descriptor(entity: &str, pipeline: &[JsonValue]) -> String {
    let stages: Vec<&str> = pipeline
        .iter()
        .filter_map(|stage| stage.as_object())
        .filter_map(|stage| stage.keys().next().map(String::as_str))
        .collect();
    format!("aggregate {} [{}]", entity, stages.join(","))
}

/// Result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OperationResult {
    Records(Vec<Record>),
    Record(Option<Record>),
    Deleted(bool),
    Count(u64),
}

impl OperationResult {
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::Records(records) => records,
            Self::Record(record) => record.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Self::Record(record) => record,
            Self::Records(records) => records.into_iter().next(),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Self::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_deleted(&self) -> Option<bool> {
        match self {
            Self::Deleted(deleted) => Some(*deleted),
            _ => None,
        }
    }

    /// Number of records carried by this result.
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Records(records) => records.len() as u64,
            Self::Record(record) => u64::from(record.is_some()),
            Self::Deleted(deleted) => u64::from(*deleted),
            Self::Count(_) => 1,
        }
    }
}

/// A value bound to a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Arrays and objects, stored as JSON text where the backend has no JSON type
    Json(JsonValue),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .unwrap_or_else(|| Self::String(n.to_string())),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}
