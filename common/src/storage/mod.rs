pub mod config;
pub mod factory;
pub mod postgres;
pub mod rqlite;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

/// A single SQL value, as bound to a parameter or read from a result column.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Bytes),
}

impl SqlValue {
    /// Name of the storage class, used in type-mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// How named parameters are spelled in the parameter map handed to an engine.
///
/// SQLite-family SQL references parameters as `:name`; the embedded engine
/// expects the map keys to carry the same `:` prefix, while the HTTP engine
/// takes bare names in its JSON parameter object. Postgres SQL references
/// them as `@name` and the map keys match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamStyle {
    Colon,
    Bare,
    At,
}

impl ParamStyle {
    /// Spells a parameter name for this style.
    pub fn name(&self, name: &str) -> String {
        match self {
            ParamStyle::Colon => format!(":{}", name),
            ParamStyle::Bare => name.to_string(),
            ParamStyle::At => format!("@{}", name),
        }
    }
}

/// Ordered named parameters for one statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Vec<(String, SqlValue)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter. The name must already be spelled for the target engine.
    pub fn bind(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, SqlValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A row-returning statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub sql: String,
    pub params: Params,
}

impl Query {
    pub fn new(sql: impl Into<String>, params: Params) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// A data-modifying statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub sql: String,
    pub params: Params,
    /// When set, the whole transaction is rolled back unless this statement
    /// affects exactly this many rows.
    pub expected_rows: Option<i64>,
}

impl Mutation {
    pub fn new(sql: impl Into<String>, params: Params) -> Self {
        Self {
            sql: sql.into(),
            params,
            expected_rows: None,
        }
    }

    /// Requires the statement to affect exactly `rows` rows for the
    /// surrounding transaction to commit.
    pub fn expect_rows(mut self, rows: i64) -> Self {
        self.expected_rows = Some(rows);
        self
    }
}

/// A positional result row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    fn at(&self, index: usize) -> StorageResult<&SqlValue> {
        self.values.get(index).ok_or_else(|| {
            StorageError::Internal(format!(
                "column {} out of range, row has {} columns",
                index,
                self.values.len()
            ))
        })
    }

    /// Reads an integer column.
    pub fn i64_at(&self, index: usize) -> StorageResult<i64> {
        match self.at(index)? {
            SqlValue::Integer(v) => Ok(*v),
            other => Err(type_mismatch(index, "integer", other)),
        }
    }

    /// Reads a text column.
    pub fn text_at(&self, index: usize) -> StorageResult<&str> {
        match self.at(index)? {
            SqlValue::Text(v) => Ok(v),
            other => Err(type_mismatch(index, "text", other)),
        }
    }

    /// Reads a nullable text column.
    pub fn opt_text_at(&self, index: usize) -> StorageResult<Option<&str>> {
        match self.at(index)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) => Ok(Some(v)),
            other => Err(type_mismatch(index, "text", other)),
        }
    }
}

fn type_mismatch(index: usize, expected: &str, actual: &SqlValue) -> StorageError {
    StorageError::Internal(format!(
        "column {}: expected {}, got {}",
        index,
        expected,
        actual.type_name()
    ))
}

/// Error type for storage operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The engine failed or rejected a statement, or could not be reached.
    Storage(String),
    /// Result decoding failed or an internal invariant was broken.
    Internal(String),
    /// The mutation at `index` did not affect `expected` rows, so the
    /// transaction was rolled back. `actual` is unknown when the engine
    /// checked the count itself.
    Precondition {
        index: usize,
        expected: i64,
        actual: Option<i64>,
    },
    /// The call was abandoned by its caller before all statements ran.
    Cancelled,
    /// The engine did not answer within the configured time.
    Timeout(Duration),
}

impl std::error::Error for StorageError {}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::Storage(msg) => write!(f, "Storage error: {}", msg),
            StorageError::Internal(msg) => write!(f, "Internal error: {}", msg),
            StorageError::Precondition {
                index,
                expected,
                actual: Some(actual),
            } => write!(
                f,
                "Precondition failed: mutation {} affected {} rows, expected {}",
                index, actual, expected
            ),
            StorageError::Precondition {
                index,
                expected,
                actual: None,
            } => write!(
                f,
                "Precondition failed: mutation {} did not affect {} rows",
                index, expected
            ),
            StorageError::Cancelled => write!(f, "Cancelled"),
            StorageError::Timeout(after) => write!(f, "Timed out after {:?}", after),
        }
    }
}

impl StorageError {
    /// Converts a storage error to StorageError::Storage.
    pub fn from_storage(e: impl std::fmt::Display) -> Self {
        StorageError::Storage(e.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A SQL engine that can run batches of parameterised statements.
///
/// Implementations normalise engine-specific results into [`Row`]s with the
/// same column order as the `select` list, and execute every `mutate` call
/// as a single transaction.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Short engine name for logs.
    fn kind(&self) -> &'static str;

    /// How this engine expects parameter names to be spelled.
    fn param_style(&self) -> ParamStyle;

    /// Runs each query and returns one row list per query, in input order.
    /// All queries of one call read the same snapshot.
    async fn query(&self, queries: &[Query]) -> StorageResult<Vec<Vec<Row>>>;

    /// Runs all mutations in one transaction and returns rows affected per
    /// mutation.
    ///
    /// A statement that affects zero rows is not an error, unless it carries
    /// [`Mutation::expected_rows`] and the count differs, in which case the
    /// transaction is rolled back and [`StorageError::Precondition`] returned.
    /// Any engine error rolls back the whole transaction.
    async fn mutate(&self, mutations: &[Mutation]) -> StorageResult<Vec<i64>>;

    /// Runs a query that returns exactly one row with one integer column.
    async fn query_scalar_i64(&self, query: &Query) -> StorageResult<i64> {
        let mut outputs = self.query(std::slice::from_ref(query)).await?;
        let rows = outputs.pop().unwrap_or_default();
        if rows.len() != 1 {
            return Err(StorageError::Internal(format!(
                "expected 1 row, got {}",
                rows.len()
            )));
        }
        if rows[0].len() != 1 {
            return Err(StorageError::Internal(format!(
                "expected 1 column, got {}",
                rows[0].len()
            )));
        }
        rows[0].i64_at(0)
    }
}
