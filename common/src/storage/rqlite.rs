//! rqlite engine reached over its HTTP API.
//!
//! Reads go to `/db/query` with the configured consistency level, writes to
//! `/db/execute` as a single transaction. Statements travel as
//! `[sql, {name: value}]` pairs and results come back as JSON arrays, so
//! numbers are narrowed back to integers where they are integral.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use super::config::{ReadConsistency, RqliteStorageConfig};
use super::{
    Mutation, ParamStyle, Params, Query, Row, SqlBackend, SqlValue, StorageError, StorageResult,
};

/// Fails the surrounding transaction unless the statement before it changed
/// exactly `:expected` rows.
const ROW_COUNT_GUARD_SQL: &str = "select json('row count mismatch') where changes() <> :expected";

#[derive(Debug, Default, Deserialize)]
struct Response {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
    #[serde(default)]
    rows_affected: i64,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for one rqlite cluster.
#[derive(Clone)]
pub struct RqliteBackend {
    base_url: String,
    http_client: reqwest::Client,
    read_consistency: ReadConsistency,
    timeout: Duration,
    credentials: Option<(String, Option<String>)>,
}

impl RqliteBackend {
    pub fn new(config: &RqliteStorageConfig) -> StorageResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Storage(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(config, http_client))
    }

    /// Uses a caller-supplied HTTP client, e.g. one with custom TLS roots.
    pub fn with_client(config: &RqliteStorageConfig, http_client: reqwest::Client) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            http_client,
            read_consistency: config.read_consistency,
            timeout: config.timeout,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        }
    }

    async fn post(&self, url: String, statements: Vec<Value>) -> StorageResult<Response> {
        let mut request = self.http_client.post(&url).json(&statements);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_deref());
        }
        tracing::debug!(url = %url, statements = statements.len(), "sending rqlite request");
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(StorageError::Storage(format!(
                "rqlite returned {}: {}",
                status,
                body.trim()
            )));
        }
        let response: Response = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        if let Some(error) = response.error {
            return Err(StorageError::Storage(error));
        }
        Ok(response)
    }

    fn transport_error(&self, e: reqwest::Error) -> StorageError {
        if e.is_timeout() {
            StorageError::Timeout(self.timeout)
        } else if e.is_decode() {
            StorageError::Internal(format!("invalid rqlite response: {}", e))
        } else {
            StorageError::Storage(format!("rqlite request failed: {}", e))
        }
    }

    fn timeout_param(&self) -> String {
        format!("{}ms", self.timeout.as_millis())
    }
}

fn encode_statement(sql: &str, params: &Params) -> StorageResult<Value> {
    if params.is_empty() {
        return Ok(Value::Array(vec![Value::String(sql.to_string())]));
    }
    let mut named = Map::with_capacity(params.len());
    for (name, value) in params.iter() {
        named.insert(name.clone(), encode_value(name, value)?);
    }
    Ok(Value::Array(vec![
        Value::String(sql.to_string()),
        Value::Object(named),
    ]))
}

fn encode_value(name: &str, value: &SqlValue) -> StorageResult<Value> {
    Ok(match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(v) => Value::from(*v),
        SqlValue::Real(v) => Number::from_f64(*v).map(Value::Number).ok_or_else(|| {
            StorageError::Internal(format!("parameter {}: {} is not a finite number", name, v))
        })?,
        SqlValue::Text(v) => Value::String(v.clone()),
        SqlValue::Blob(_) => {
            return Err(StorageError::Internal(format!(
                "parameter {}: blob values are not supported by rqlite",
                name
            )));
        }
    })
}

fn decode_value(value: Value, declared: &str) -> StorageResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(v) => SqlValue::Integer(v as i64),
        Value::Number(n) => decode_number(&n, declared)?,
        Value::String(v) => SqlValue::Text(v),
        // JSON columns may come back already parsed.
        other => SqlValue::Text(other.to_string()),
    })
}

fn decode_number(n: &Number, declared: &str) -> StorageResult<SqlValue> {
    if let Some(v) = n.as_i64() {
        return Ok(SqlValue::Integer(v));
    }
    let v = n
        .as_f64()
        .ok_or_else(|| StorageError::Internal(format!("unrepresentable number {}", n)))?;
    let integral = v.fract() == 0.0 && v >= i64::MIN as f64 && v <= i64::MAX as f64;
    if integral {
        return Ok(SqlValue::Integer(v as i64));
    }
    if declared.eq_ignore_ascii_case("integer") {
        return Err(StorageError::Internal(format!(
            "integer column holds non-integral value {}",
            v
        )));
    }
    Ok(SqlValue::Real(v))
}

fn decode_rows(result: StatementResult) -> StorageResult<Vec<Row>> {
    let columns = result.columns.len();
    let mut rows = Vec::with_capacity(result.values.len());
    for values in result.values {
        if values.len() != columns {
            return Err(StorageError::Internal(format!(
                "expected {} columns, got {}",
                columns,
                values.len()
            )));
        }
        let row = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| decode_value(v, result.types.get(i).map_or("", String::as_str)))
            .collect::<StorageResult<Vec<_>>>()?;
        rows.push(Row::new(row));
    }
    Ok(rows)
}

/// Position of each caller mutation in the statement list sent to rqlite,
/// after row count guards have been interleaved.
struct Plan {
    statements: Vec<Value>,
    positions: Vec<usize>,
    guards: Vec<(usize, usize, i64)>,
}

fn plan_mutations(mutations: &[Mutation]) -> StorageResult<Plan> {
    let mut plan = Plan {
        statements: Vec::with_capacity(mutations.len()),
        positions: Vec::with_capacity(mutations.len()),
        guards: Vec::new(),
    };
    for (index, mutation) in mutations.iter().enumerate() {
        plan.positions.push(plan.statements.len());
        plan.statements
            .push(encode_statement(&mutation.sql, &mutation.params)?);
        if let Some(expected) = mutation.expected_rows {
            plan.guards.push((plan.statements.len(), index, expected));
            let params = Params::new().bind("expected", expected);
            plan.statements
                .push(encode_statement(ROW_COUNT_GUARD_SQL, &params)?);
        }
    }
    Ok(plan)
}

#[async_trait]
impl SqlBackend for RqliteBackend {
    fn kind(&self) -> &'static str {
        "rqlite"
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Bare
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = queries.len()))]
    async fn query(&self, queries: &[Query]) -> StorageResult<Vec<Vec<Row>>> {
        let statements = queries
            .iter()
            .map(|q| encode_statement(&q.sql, &q.params))
            .collect::<StorageResult<Vec<_>>>()?;
        // Several queries share one snapshot only inside a transaction.
        let transaction = if queries.len() > 1 { "&transaction" } else { "" };
        let url = format!(
            "{}/db/query?level={}&timeout={}{}",
            self.base_url,
            self.read_consistency.as_str(),
            self.timeout_param(),
            transaction
        );
        let response = self.post(url, statements).await?;
        if response.results.len() != queries.len() {
            return Err(StorageError::Internal(format!(
                "expected {} results, got {}",
                queries.len(),
                response.results.len()
            )));
        }
        let mut outputs = Vec::with_capacity(queries.len());
        for result in response.results {
            if let Some(error) = result.error {
                return Err(StorageError::Storage(error));
            }
            outputs.push(decode_rows(result)?);
        }
        Ok(outputs)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = mutations.len()))]
    async fn mutate(&self, mutations: &[Mutation]) -> StorageResult<Vec<i64>> {
        let plan = plan_mutations(mutations)?;
        let url = format!(
            "{}/db/execute?transaction&timeout={}",
            self.base_url,
            self.timeout_param()
        );
        let sent = plan.statements.len();
        let response = self.post(url, plan.statements).await?;

        // A failed transaction reports results only up to the failing statement.
        if let Some((position, error)) = response
            .results
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.error.as_ref().map(|e| (i, e)))
        {
            if let Some(&(_, index, expected)) =
                plan.guards.iter().find(|(at, _, _)| *at == position)
            {
                tracing::debug!(index, expected, "rqlite rolled back on row count mismatch");
                return Err(StorageError::Precondition {
                    index,
                    expected,
                    actual: None,
                });
            }
            return Err(StorageError::Storage(error.clone()));
        }
        if response.results.len() != sent {
            return Err(StorageError::Internal(format!(
                "expected {} results, got {}",
                sent,
                response.results.len()
            )));
        }
        Ok(plan
            .positions
            .iter()
            .map(|&at| response.results[at].rows_affected)
            .collect())
    }
}
