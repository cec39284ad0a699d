//! SQL statement building.
//!
//! Every statement the relational adapters run is produced here from an entity name and
//! JSON maps. Identifiers are validated and quoted; values are always bound, never inlined.
//!
//! PostgreSQL is strictly typed, so values travel as a single `jsonb` parameter and are
//! projected onto the table's own row type with `jsonb_populate_record`; rows come back as
//! `to_jsonb(t)`. MySQL and SQLite bind scalars directly.

use crate::error::{DbError, DbResult};
use crate::models::{Conditions, FindOptions, QueryParam, Record, SortDirection};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};

/// SQL backend a statement is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    SQLite,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgres",
            Self::SQLite => "sqlite",
        }
    }

    /// Quote an identifier that has already been validated.
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", ident),
            Self::Postgres | Self::SQLite => format!("\"{}\"", ident),
        }
    }

    /// Placeholder for the `n`th (1-based) bound parameter.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Postgres => format!("${}", n),
            Self::MySql | Self::SQLite => "?".to_string(),
        }
    }

    /// Timestamp literal in the form the backend stores in its timestamp columns.
    pub fn format_timestamp(&self, ts: DateTime<Utc>) -> String {
        match self {
            Self::MySql => ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            Self::Postgres | Self::SQLite => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Row-count bound used when only an offset is requested.
    fn unbounded_limit(&self) -> Option<&'static str> {
        match self {
            Self::MySql => Some("18446744073709551615"),
            Self::SQLite => Some("-1"),
            Self::Postgres => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Check that a table or column name is a plain identifier.
pub fn validate_identifier(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && name.len() <= 64 {
        Ok(())
    } else {
        Err(DbError::validation(format!("Invalid identifier: '{}'", name)))
    }
}

/// A statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder.
    fn bind(&mut self, dialect: Dialect, param: QueryParam) -> String {
        self.params.push(param);
        dialect.placeholder(self.params.len())
    }
}

/// Builds statements for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct SqlBuilder {
    dialect: Dialect,
}

const PG_ALIAS: &str = "t";

impl SqlBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Column reference inside a statement over `entity`.
    fn column(&self, name: &str) -> String {
        match self.dialect {
            Dialect::Postgres => format!("{}.{}", PG_ALIAS, self.dialect.quote(name)),
            _ => self.dialect.quote(name),
        }
    }

    /// Table reference in a FROM/UPDATE/INSERT target.
    fn table(&self, entity: &str) -> String {
        match self.dialect {
            Dialect::Postgres => format!("{} AS {}", self.dialect.quote(entity), PG_ALIAS),
            _ => self.dialect.quote(entity),
        }
    }

    /// Projection returning one JSON-decodable row.
    fn projection(&self) -> String {
        match self.dialect {
            Dialect::Postgres => format!("to_jsonb({})", PG_ALIAS),
            _ => "*".to_string(),
        }
    }

    /// Field `name` of the jsonb parameter at `placeholder`, typed as the table's column.
    fn pg_field(&self, entity: &str, placeholder: &str, name: &str) -> String {
        format!(
            "(jsonb_populate_record(NULL::{}, {})).{}",
            self.dialect.quote(entity),
            placeholder,
            self.dialect.quote(name)
        )
    }

    /// Bind every non-null value of `values`, returning one SQL expression per key.
    fn bind_values(
        &self,
        stmt: &mut Statement,
        entity: &str,
        values: &Map<String, JsonValue>,
    ) -> DbResult<Vec<(String, Option<String>)>> {
        for key in values.keys() {
            validate_identifier(key)?;
        }
        let bound: Map<String, JsonValue> = values
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let pg_param = match self.dialect {
            Dialect::Postgres if !bound.is_empty() => {
                Some(stmt.bind(self.dialect, QueryParam::Json(JsonValue::Object(bound))))
            }
            _ => None,
        };

        let mut exprs = Vec::with_capacity(values.len());
        for (key, value) in values {
            let expr = if value.is_null() {
                None
            } else if let Some(placeholder) = &pg_param {
                Some(self.pg_field(entity, placeholder, key))
            } else {
                Some(stmt.bind(self.dialect, scalar_param(value)))
            };
            exprs.push((key.clone(), expr));
        }
        Ok(exprs)
    }

    fn push_where(
        &self,
        stmt: &mut Statement,
        entity: &str,
        conditions: &Conditions,
        live_column: Option<&str>,
    ) -> DbResult<()> {
        let mut clauses = Vec::new();
        for (key, expr) in self.bind_values(stmt, entity, conditions)? {
            match expr {
                Some(expr) => clauses.push(format!("{} = {}", self.column(&key), expr)),
                None => clauses.push(format!("{} IS NULL", self.column(&key))),
            }
        }
        if let Some(col) = live_column {
            clauses.push(format!("{} IS NULL", self.column(col)));
        }
        if !clauses.is_empty() {
            stmt.sql.push_str(" WHERE ");
            stmt.sql.push_str(&clauses.join(" AND "));
        }
        Ok(())
    }

    fn push_limit(&self, sql: &mut String, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(_)) => {
                if let Some(unbounded) = self.dialect.unbounded_limit() {
                    sql.push_str(&format!(" LIMIT {}", unbounded));
                }
            }
            (None, None) => {}
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }
    }

    /// `SELECT` matching rows, optionally excluding rows with `live_column` set.
    pub fn select(
        &self,
        entity: &str,
        conditions: &Conditions,
        options: &FindOptions,
        live_column: Option<&str>,
    ) -> DbResult<Statement> {
        validate_identifier(entity)?;
        let mut stmt = Statement::new(format!(
            "SELECT {} FROM {}",
            self.projection(),
            self.table(entity)
        ));
        self.push_where(&mut stmt, entity, conditions, live_column)?;

        if !options.order_by.is_empty() {
            let mut order = Vec::with_capacity(options.order_by.len());
            for o in &options.order_by {
                validate_identifier(&o.field)?;
                order.push(format!("{} {}", self.column(&o.field), o.direction.as_sql()));
            }
            stmt.sql.push_str(" ORDER BY ");
            stmt.sql.push_str(&order.join(", "));
        }
        self.push_limit(&mut stmt.sql, options.limit, options.offset);
        Ok(stmt)
    }

    /// `SELECT` one row by SQLite rowid.
    pub fn select_by_rowid(&self, entity: &str, rowid: i64) -> DbResult<Statement> {
        validate_identifier(entity)?;
        let mut stmt = Statement::new(format!(
            "SELECT {} FROM {} WHERE rowid = ",
            self.projection(),
            self.table(entity)
        ));
        let placeholder = stmt.bind(self.dialect, QueryParam::Int(rowid));
        stmt.sql.push_str(&placeholder);
        Ok(stmt)
    }

    /// Count matching rows as a single `count` column.
    pub fn count(
        &self,
        entity: &str,
        conditions: &Conditions,
        live_column: Option<&str>,
    ) -> DbResult<Statement> {
        validate_identifier(entity)?;
        let projection = match self.dialect {
            Dialect::Postgres => "jsonb_build_object('count', COUNT(*))".to_string(),
            _ => format!("COUNT(*) AS {}", self.dialect.quote("count")),
        };
        let mut stmt = Statement::new(format!(
            "SELECT {} FROM {}",
            projection,
            self.table(entity)
        ));
        self.push_where(&mut stmt, entity, conditions, live_column)?;
        Ok(stmt)
    }

    /// `INSERT` one record. PostgreSQL returns the stored row.
    pub fn insert(&self, entity: &str, data: &Record) -> DbResult<Statement> {
        validate_identifier(entity)?;
        for key in data.keys() {
            validate_identifier(key)?;
        }
        let columns: Vec<String> = data.keys().map(|k| self.dialect.quote(k)).collect();

        match self.dialect {
            Dialect::Postgres => {
                let mut stmt = Statement::new(format!("INSERT INTO {}", self.table(entity)));
                if columns.is_empty() {
                    stmt.sql.push_str(" DEFAULT VALUES");
                } else {
                    let placeholder =
                        stmt.bind(self.dialect, QueryParam::Json(JsonValue::Object(data.clone())));
                    let cols = columns.join(", ");
                    stmt.sql.push_str(&format!(
                        " ({cols}) SELECT {cols} FROM jsonb_populate_record(NULL::{}, {})",
                        self.dialect.quote(entity),
                        placeholder
                    ));
                }
                stmt.sql
                    .push_str(&format!(" RETURNING {}", self.projection()));
                Ok(stmt)
            }
            Dialect::MySql | Dialect::SQLite => {
                let mut stmt = Statement::new(format!("INSERT INTO {}", self.table(entity)));
                if columns.is_empty() {
                    stmt.sql.push_str(match self.dialect {
                        Dialect::MySql => " () VALUES ()",
                        _ => " DEFAULT VALUES",
                    });
                } else {
                    let placeholders: Vec<String> = data
                        .values()
                        .map(|v| stmt.bind(self.dialect, scalar_param(v)))
                        .collect();
                    stmt.sql.push_str(&format!(
                        " ({}) VALUES ({})",
                        columns.join(", "),
                        placeholders.join(", ")
                    ));
                }
                Ok(stmt)
            }
        }
    }

    /// `UPDATE` the rows matching `conditions`. PostgreSQL returns the updated rows.
    pub fn update(
        &self,
        entity: &str,
        conditions: &Conditions,
        data: &Record,
        live_column: Option<&str>,
    ) -> DbResult<Statement> {
        validate_identifier(entity)?;
        if data.is_empty() {
            return Err(DbError::validation("Update data cannot be empty"));
        }
        let mut stmt = Statement::new(format!("UPDATE {} SET ", self.table(entity)));
        let assignments: Vec<String> = self
            .bind_values(&mut stmt, entity, data)?
            .into_iter()
            .map(|(key, expr)| {
                // SET targets are never alias-qualified
                format!(
                    "{} = {}",
                    self.dialect.quote(&key),
                    expr.unwrap_or_else(|| "NULL".to_string())
                )
            })
            .collect();
        stmt.sql.push_str(&assignments.join(", "));
        self.push_where(&mut stmt, entity, conditions, live_column)?;
        if self.dialect == Dialect::Postgres {
            stmt.sql
                .push_str(&format!(" RETURNING {}", self.projection()));
        }
        Ok(stmt)
    }

    /// `DELETE` the rows matching `conditions`.
    pub fn delete(&self, entity: &str, conditions: &Conditions) -> DbResult<Statement> {
        validate_identifier(entity)?;
        let mut stmt = Statement::new(format!("DELETE FROM {}", self.table(entity)));
        self.push_where(&mut stmt, entity, conditions, None)?;
        Ok(stmt)
    }

    /// Translate an aggregation pipeline into a single `SELECT`.
    pub fn aggregate(
        &self,
        entity: &str,
        pipeline: &[JsonValue],
        live_column: Option<&str>,
    ) -> DbResult<Statement> {
        validate_identifier(entity)?;
        let plan = AggregatePlan::parse(pipeline)?;

        let mut stmt = Statement::new(String::new());
        let Some(group) = &plan.group else {
            let options = FindOptions {
                limit: plan.limit,
                offset: plan.skip,
                order_by: plan.sort.clone(),
            };
            return self.select(entity, &plan.filter, &options, live_column);
        };

        let mut projections = vec![match &group.key {
            Some(field) => format!("{} AS {}", self.column(field), self.dialect.quote("_id")),
            None => format!("NULL AS {}", self.dialect.quote("_id")),
        }];
        for acc in &group.accumulators {
            let expr = match (&acc.function, &acc.field) {
                (Accumulator::Count, _) => "COUNT(*)".to_string(),
                (function, Some(field)) => format!("{}({})", function.sql(), self.column(field)),
                (function, None) => format!("{}({})", function.sql(), acc.constant),
            };
            projections.push(format!("{} AS {}", expr, self.dialect.quote(&acc.name)));
        }

        stmt.sql = format!(
            "SELECT {} FROM {}",
            projections.join(", "),
            self.table(entity)
        );
        self.push_where(&mut stmt, entity, &plan.filter, live_column)?;
        if let Some(field) = &group.key {
            stmt.sql
                .push_str(&format!(" GROUP BY {}", self.column(field)));
        }

        let outputs: Vec<&str> = std::iter::once("_id")
            .chain(group.accumulators.iter().map(|a| a.name.as_str()))
            .collect();
        let mut order = Vec::with_capacity(plan.sort.len());
        for o in &plan.sort {
            if !outputs.contains(&o.field.as_str()) {
                return Err(DbError::validation(format!(
                    "$sort after $group can only use group output fields, not '{}'",
                    o.field
                )));
            }
            let target = match self.dialect {
                Dialect::Postgres => format!("r.{}", self.dialect.quote(&o.field)),
                _ => self.dialect.quote(&o.field),
            };
            order.push(format!("{} {}", target, o.direction.as_sql()));
        }

        let mut tail = String::new();
        if !order.is_empty() {
            tail.push_str(" ORDER BY ");
            tail.push_str(&order.join(", "));
        }
        self.push_limit(&mut tail, plan.limit, plan.skip);

        if self.dialect == Dialect::Postgres {
            stmt.sql = format!("SELECT to_jsonb(r) FROM ({}) r{}", stmt.sql, tail);
        } else {
            stmt.sql.push_str(&tail);
        }
        Ok(stmt)
    }
}

/// Convert a JSON value into a directly bound scalar.
///
/// Arrays and objects are stored as their JSON text.
fn scalar_param(value: &JsonValue) -> QueryParam {
    match QueryParam::from(value) {
        QueryParam::Json(v) => QueryParam::String(v.to_string()),
        other => other,
    }
}

// =============================================================================
// Aggregation pipeline translation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Accumulator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "$sum" => Some(Self::Sum),
            "$avg" => Some(Self::Avg),
            "$min" => Some(Self::Min),
            "$max" => Some(Self::Max),
            "$count" => Some(Self::Count),
            _ => None,
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Count => "COUNT",
        }
    }
}

#[derive(Debug)]
struct GroupOutput {
    name: String,
    function: Accumulator,
    /// Column argument; `None` with a numeric constant such as `{"$sum": 1}`
    field: Option<String>,
    constant: String,
}

#[derive(Debug)]
struct GroupStage {
    key: Option<String>,
    accumulators: Vec<GroupOutput>,
}

#[derive(Debug, Default)]
struct AggregatePlan {
    filter: Conditions,
    group: Option<GroupStage>,
    sort: Vec<crate::models::OrderBy>,
    limit: Option<u64>,
    skip: Option<u64>,
}

fn unsupported(stage: &str) -> DbError {
    DbError::unsupported(format!("aggregate stage {}", stage), "relational-sql")
}

/// `"$field"` reference to a validated column name.
fn field_ref(value: &JsonValue, stage: &str) -> DbResult<String> {
    let field = value
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .ok_or_else(|| DbError::validation(format!("{} expects a \"$field\" reference", stage)))?;
    validate_identifier(field)?;
    Ok(field.to_string())
}

fn stage_count(value: &JsonValue, stage: &str) -> DbResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| DbError::validation(format!("{} expects a non-negative integer", stage)))
}

impl AggregatePlan {
    fn parse(pipeline: &[JsonValue]) -> DbResult<Self> {
        let mut plan = Self::default();

        for stage in pipeline {
            let obj = stage
                .as_object()
                .filter(|o| o.len() == 1)
                .ok_or_else(|| {
                    DbError::validation("Each pipeline stage must be an object with one key")
                })?;
            let Some((name, body)) = obj.iter().next() else {
                continue;
            };

            match name.as_str() {
                "$match" => {
                    if plan.group.is_some() {
                        return Err(unsupported("$match after $group"));
                    }
                    let conditions = body
                        .as_object()
                        .ok_or_else(|| DbError::validation("$match expects an object"))?;
                    for (key, value) in conditions {
                        if key.starts_with('$')
                            || value
                                .as_object()
                                .is_some_and(|o| o.keys().any(|k| k.starts_with('$')))
                        {
                            return Err(unsupported("$match with operators"));
                        }
                        plan.filter.insert(key.clone(), value.clone());
                    }
                }
                "$group" => {
                    if plan.group.is_some() {
                        return Err(unsupported("$group (more than one)"));
                    }
                    if !plan.sort.is_empty() || plan.limit.is_some() || plan.skip.is_some() {
                        return Err(unsupported("$group after $sort, $limit or $skip"));
                    }
                    plan.group = Some(Self::parse_group(body)?);
                }
                "$sort" => {
                    let fields = body
                        .as_object()
                        .ok_or_else(|| DbError::validation("$sort expects an object"))?;
                    for (field, dir) in fields {
                        validate_identifier(field)?;
                        let direction = match dir.as_i64() {
                            Some(1) => SortDirection::Asc,
                            Some(-1) => SortDirection::Desc,
                            _ => {
                                return Err(DbError::validation(format!(
                                    "$sort direction for '{}' must be 1 or -1",
                                    field
                                )));
                            }
                        };
                        plan.sort.push(crate::models::OrderBy {
                            field: field.clone(),
                            direction,
                        });
                    }
                }
                "$limit" => {
                    let n = stage_count(body, "$limit")?;
                    plan.limit = Some(plan.limit.map_or(n, |l| l.min(n)));
                }
                "$skip" => {
                    if plan.limit.is_some() {
                        return Err(unsupported("$skip after $limit"));
                    }
                    let n = stage_count(body, "$skip")?;
                    plan.skip = Some(plan.skip.unwrap_or(0) + n);
                }
                other => return Err(unsupported(other)),
            }
        }
        Ok(plan)
    }

    fn parse_group(body: &JsonValue) -> DbResult<GroupStage> {
        let spec = body
            .as_object()
            .ok_or_else(|| DbError::validation("$group expects an object"))?;
        let key = match spec.get("_id") {
            None => return Err(DbError::validation("$group requires an _id")),
            Some(JsonValue::Null) => None,
            Some(JsonValue::String(_)) => Some(field_ref(&spec["_id"], "$group _id")?),
            Some(_) => return Err(unsupported("$group with a compound _id")),
        };

        let mut accumulators = Vec::new();
        for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            validate_identifier(name)?;
            let (op, arg) = acc
                .as_object()
                .filter(|o| o.len() == 1)
                .and_then(|o| o.iter().next())
                .ok_or_else(|| {
                    DbError::validation(format!("Accumulator '{}' must have one operator", name))
                })?;
            let function = Accumulator::parse(op)
                .ok_or_else(|| unsupported(&format!("$group accumulator {}", op)))?;

            let (field, constant) = match (function, arg) {
                (Accumulator::Count, _) => (None, String::new()),
                (_, JsonValue::Number(n)) => (None, n.to_string()),
                (_, arg) => (Some(field_ref(arg, op)?), String::new()),
            };
            accumulators.push(GroupOutput {
                name: name.clone(),
                function,
                field,
                constant,
            });
        }
        Ok(GroupStage { key, accumulators })
    }
}
