use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};
use tracing::instrument;

use crate::errors::{Result, ToolbridgeError};

pub const MAX_LIMIT: i64 = 1000;
pub const DEFAULT_LIMIT: i64 = 100;

/// A statement ready for execution: SQL text with `$n` placeholders and the
/// values to bind, in placeholder order. Caller-supplied values never appear
/// in `text`; only validated identifiers do.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Select,
    Insert,
    Update,
    Delete,
    Count,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Action::Select => "select",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Count => "count",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub action: Action,
    pub table: String,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default, rename = "where")]
    pub filter: Option<Map<String, Value>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub order_direction: Option<String>,
}

/// Builds parameterized statements against a closed set of tables.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    allowed_tables: HashSet<String>,
}

impl QueryBuilder {
    pub fn new(allowed_tables: impl IntoIterator<Item = String>) -> Result<Self> {
        let allowed_tables: HashSet<String> = allowed_tables
            .into_iter()
            .map(|table| table.trim().to_string())
            .filter(|table| !table.is_empty())
            .collect();
        if allowed_tables.is_empty() {
            return Err(ToolbridgeError::InvalidConfig(
                "no allowed tables configured for the storage tool".to_string(),
            ));
        }
        for table in &allowed_tables {
            validate_identifier(table)?;
        }
        Ok(Self { allowed_tables })
    }

    pub fn is_table_allowed(&self, table: &str) -> bool {
        self.allowed_tables.contains(table)
    }

    #[instrument(skip(self, request), fields(action = %request.action, table = %request.table))]
    pub fn build(&self, request: &QueryRequest) -> Result<Statement> {
        if !self.is_table_allowed(&request.table) {
            return Err(ToolbridgeError::TableNotAllowed(request.table.clone()));
        }
        match request.action {
            Action::Select => self.build_select(request),
            Action::Insert => self.build_insert(request),
            Action::Update => self.build_update(request),
            Action::Delete => self.build_delete(request),
            Action::Count => self.build_count(request),
        }
    }

    fn build_select(&self, request: &QueryRequest) -> Result<Statement> {
        let mut text = format!("SELECT * FROM {}", request.table);
        let mut values = Vec::new();
        append_where(&mut text, &mut values, request.filter.as_ref())?;

        if let Some(order_by) = request.order_by.as_deref() {
            validate_identifier(order_by)?;
            let direction = coerce_direction(request.order_direction.as_deref());
            text.push_str(&format!(" ORDER BY {order_by} {direction}"));
        }

        let limit = request
            .limit
            .unwrap_or(DEFAULT_LIMIT)
            .clamp(1, MAX_LIMIT);
        text.push_str(&format!(" LIMIT {limit}"));
        let offset = request.offset.unwrap_or(0).max(0);
        if offset > 0 {
            text.push_str(&format!(" OFFSET {offset}"));
        }
        Ok(Statement { text, values })
    }

    fn build_insert(&self, request: &QueryRequest) -> Result<Statement> {
        let data = require_entries(request.data.as_ref(), "data")?;
        let mut columns = Vec::with_capacity(data.len());
        let mut placeholders = Vec::with_capacity(data.len());
        let mut values = Vec::with_capacity(data.len());
        for (index, (column, value)) in data.iter().enumerate() {
            validate_identifier(column)?;
            columns.push(column.as_str());
            placeholders.push(format!("${}", index + 1));
            values.push(value.clone());
        }
        let text = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
            request.table,
            columns.join(", "),
            placeholders.join(", "),
        );
        Ok(Statement { text, values })
    }

    fn build_update(&self, request: &QueryRequest) -> Result<Statement> {
        let data = require_entries(request.data.as_ref(), "data")?;
        require_entries(request.filter.as_ref(), "where")?;

        let mut assignments = Vec::with_capacity(data.len());
        let mut values = Vec::new();
        for (column, value) in data {
            validate_identifier(column)?;
            values.push(value.clone());
            assignments.push(format!("{column} = ${}", values.len()));
        }
        let mut text = format!(
            "UPDATE {} SET {}",
            request.table,
            assignments.join(", "),
        );
        append_where(&mut text, &mut values, request.filter.as_ref())?;
        text.push_str(" RETURNING *");
        Ok(Statement { text, values })
    }

    fn build_delete(&self, request: &QueryRequest) -> Result<Statement> {
        require_entries(request.filter.as_ref(), "where")?;
        let mut text = format!("DELETE FROM {}", request.table);
        let mut values = Vec::new();
        append_where(&mut text, &mut values, request.filter.as_ref())?;
        text.push_str(" RETURNING *");
        Ok(Statement { text, values })
    }

    fn build_count(&self, request: &QueryRequest) -> Result<Statement> {
        let mut text = format!("SELECT COUNT(*) AS count FROM {}", request.table);
        let mut values = Vec::new();
        append_where(&mut text, &mut values, request.filter.as_ref())?;
        Ok(Statement { text, values })
    }
}

/// Strict identifier pattern: `^[A-Za-z_][A-Za-z0-9_]*$`. Identifiers are the
/// only caller-supplied input ever interpolated into statement text, and only
/// after passing this check.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ToolbridgeError::ColumnNameInvalid(name.to_string()))
    }
}

fn coerce_direction(requested: Option<&str>) -> &'static str {
    match requested {
        Some(value) if value.eq_ignore_ascii_case("desc") => "DESC",
        _ => "ASC",
    }
}

fn require_entries<'a>(
    entries: Option<&'a Map<String, Value>>,
    field: &'static str,
) -> Result<&'a Map<String, Value>> {
    match entries {
        Some(map) if !map.is_empty() => Ok(map),
        _ => Err(ToolbridgeError::MissingRequiredField(field)),
    }
}

fn append_where(
    text: &mut String,
    values: &mut Vec<Value>,
    filter: Option<&Map<String, Value>>,
) -> Result<()> {
    let Some(filter) = filter else {
        return Ok(());
    };
    if filter.is_empty() {
        return Ok(());
    }
    let mut clauses = Vec::with_capacity(filter.len());
    for (column, value) in filter {
        validate_identifier(column)?;
        if value.is_null() {
            clauses.push(format!("{column} IS NULL"));
        } else {
            values.push(value.clone());
            clauses.push(format!("{column} = ${}", values.len()));
        }
    }
    text.push_str(" WHERE ");
    text.push_str(&clauses.join(" AND "));
    Ok(())
}

/// Binds the statement's values positionally. JSON scalars map onto their
/// closest Postgres types; arrays and objects go through as jsonb.
pub fn bind_statement(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
    let mut query = sqlx::query(&statement.text);
    for value in &statement.values {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(flag) => query.bind(*flag),
            Value::Number(number) => match number.as_i64() {
                Some(integer) => query.bind(integer),
                None => query.bind(number.as_f64().unwrap_or(0.0)),
            },
            Value::String(text) => query.bind(text.as_str()),
            other => query.bind(other.clone()),
        };
    }
    query
}

/// Decodes one row into a JSON object, keyed by column name. Types without a
/// JSON mapping fall back to their text representation, or null.
pub fn row_to_value(row: &PgRow) -> Value {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "INT2" | "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::Number(v.into()))
                .unwrap_or(Value::Null),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .ok()
                .flatten()
                .and_then(|v| Number::from_f64(f64::from(v)))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .ok()
                .flatten()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .ok()
                .flatten()
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_rfc3339()))
                .unwrap_or(Value::Null),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(index)
                .ok()
                .flatten()
                .map(|v| Value::String(v.to_string()))
                .unwrap_or(Value::Null),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(index)
                .ok()
                .flatten()
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<Option<String>, _>(index)
                .ok()
                .flatten()
                .map(Value::String)
                .unwrap_or(Value::Null),
        };
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}
