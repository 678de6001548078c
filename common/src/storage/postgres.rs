//! PostgreSQL engine over `tokio-postgres`.
//!
//! Statements reference parameters as `@name`; they are rewritten to
//! positional `$n` placeholders before being sent. Every call runs in one
//! transaction on a single shared connection, which is opened on first use
//! and reopened once the server closes it.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, IsolationLevel, NoTls};

use super::config::PostgresStorageConfig;
use super::{
    Mutation, ParamStyle, Params, Query, Row, SqlBackend, SqlValue, StorageError, StorageResult,
};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Integer(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            SqlValue::Real(v) => v.to_sql_checked(ty, out),
            SqlValue::Text(v) => v.to_sql_checked(ty, out),
            SqlValue::Blob(v) => v.as_ref().to_sql_checked(ty, out),
        }
    }

    // Each variant checks the concrete type itself.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Rewrites `@name` placeholders to `$n` and lists the bound values in
/// placeholder order. Text inside quotes is left alone, and parameters the
/// statement never references are ignored.
fn bind_positional<'p>(
    sql: &str,
    params: &'p Params,
) -> StorageResult<(String, Vec<&'p SqlValue>)> {
    let mut out = String::with_capacity(sql.len());
    let mut names: Vec<&str> = Vec::new();
    let mut values = Vec::new();
    let mut quote = None;
    let mut chars = sql.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
            }
            None if c == '@' => {
                let start = i + c.len_utf8();
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    if !(n.is_ascii_alphanumeric() || n == '_') {
                        break;
                    }
                    end = j + n.len_utf8();
                    chars.next();
                }
                if end == start {
                    out.push(c);
                    continue;
                }
                let name = &sql[start..end];
                let position = match names.iter().position(|n| *n == name) {
                    Some(position) => position,
                    None => {
                        let value = params.get(&ParamStyle::At.name(name)).ok_or_else(|| {
                            StorageError::Internal(format!("no value bound for @{}", name))
                        })?;
                        names.push(name);
                        values.push(value);
                        names.len() - 1
                    }
                };
                out.push('$');
                out.push_str(&(position + 1).to_string());
            }
            None => out.push(c),
        }
    }
    Ok((out, values))
}

fn as_params<'v>(values: &'v [&'v SqlValue]) -> Vec<&'v (dyn ToSql + Sync)> {
    values.iter().map(|v| *v as &(dyn ToSql + Sync)).collect()
}

fn pg_error(e: tokio_postgres::Error) -> StorageError {
    match e.as_db_error() {
        Some(db) => StorageError::Storage(format!("{} ({})", db.message(), db.code().code())),
        None => StorageError::Storage(format!("postgres: {}", e)),
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn read_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> StorageResult<SqlValue> {
    let value = match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)
            .map(|v| v.map(|b| SqlValue::Integer(i64::from(b)))),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| v.map(|n| SqlValue::Integer(n.into()))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .map(|v| v.map(|n| SqlValue::Integer(n.into()))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)
            .map(|v| v.map(SqlValue::Integer)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| v.map(|n| SqlValue::Real(n.into()))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)
            .map(|v| v.map(SqlValue::Real)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map(SqlValue::Text)),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)
            .map(|v| v.map(|json| SqlValue::Text(json.to_string()))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .map(|v| v.map(|ts| SqlValue::Text(format_timestamp(ts)))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)
            .map(|v| v.map(|ts| SqlValue::Text(format_timestamp(ts.and_utc())))),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(index)
            .map(|v| v.map(|b| SqlValue::Blob(Bytes::from(b)))),
        _ => {
            return Err(StorageError::Internal(format!(
                "column {}: unsupported type {}",
                index, ty
            )));
        }
    };
    value
        .map(|v| v.unwrap_or(SqlValue::Null))
        .map_err(|e| StorageError::Internal(format!("column {}: {}", index, e)))
}

fn read_row(row: &tokio_postgres::Row) -> StorageResult<Row> {
    let values = row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, column)| read_value(row, i, column.type_()))
        .collect::<StorageResult<Vec<_>>>()?;
    Ok(Row::new(values))
}

/// PostgreSQL implementation of [`SqlBackend`].
pub struct PostgresBackend {
    config: tokio_postgres::Config,
    timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl PostgresBackend {
    /// Parses the connection string. Does not connect.
    pub fn new(config: &PostgresStorageConfig) -> StorageResult<Self> {
        let pg_config = config
            .url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| StorageError::Storage(format!("invalid postgres url: {}", e)))?;
        Ok(Self {
            config: pg_config,
            timeout: config.timeout,
            client: Mutex::new(None),
        })
    }

    async fn client(&self) -> StorageResult<MutexGuard<'_, Option<Client>>> {
        let mut client = self.client.lock().await;
        if client.as_ref().is_none_or(Client::is_closed) {
            let (connected, connection) = self.config.connect(NoTls).await.map_err(|e| {
                StorageError::Storage(format!("Failed to connect to postgres: {}", e))
            })?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!(error = %e, "postgres connection closed");
                }
            });
            tracing::debug!("connected to postgres");
            *client = Some(connected);
        }
        Ok(client)
    }

    async fn run_queries(&self, queries: &[Query]) -> StorageResult<Vec<Vec<Row>>> {
        let mut guard = self.client().await?;
        let client = guard
            .as_mut()
            .ok_or_else(|| StorageError::Internal("postgres client missing".to_string()))?;
        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(pg_error)?;
        let mut outputs = Vec::with_capacity(queries.len());
        for query in queries {
            let (sql, values) = bind_positional(&query.sql, &query.params)?;
            let rows = tx
                .query(sql.as_str(), &as_params(&values))
                .await
                .map_err(pg_error)?;
            outputs.push(rows.iter().map(read_row).collect::<StorageResult<Vec<_>>>()?);
        }
        tx.commit().await.map_err(pg_error)?;
        Ok(outputs)
    }

    async fn run_mutations(&self, mutations: &[Mutation]) -> StorageResult<Vec<i64>> {
        let mut guard = self.client().await?;
        let client = guard
            .as_mut()
            .ok_or_else(|| StorageError::Internal("postgres client missing".to_string()))?;
        // Dropping the transaction without committing rolls it back.
        let tx = client.transaction().await.map_err(pg_error)?;
        let mut affected = Vec::with_capacity(mutations.len());
        for (index, mutation) in mutations.iter().enumerate() {
            let (sql, values) = bind_positional(&mutation.sql, &mutation.params)?;
            let rows = tx
                .execute(sql.as_str(), &as_params(&values))
                .await
                .map_err(pg_error)?;
            let rows = i64::try_from(rows)
                .map_err(|_| StorageError::Internal(format!("{} rows affected", rows)))?;
            match mutation.expected_rows {
                Some(expected) if rows != expected => {
                    tracing::debug!(index, expected, rows, "rolling back on row count mismatch");
                    tx.rollback().await.map_err(pg_error)?;
                    return Err(StorageError::Precondition {
                        index,
                        expected,
                        actual: Some(rows),
                    });
                }
                _ => {}
            }
            affected.push(rows);
        }
        tx.commit().await.map_err(pg_error)?;
        Ok(affected)
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::At
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = queries.len()))]
    async fn query(&self, queries: &[Query]) -> StorageResult<Vec<Vec<Row>>> {
        tokio::time::timeout(self.timeout, self.run_queries(queries))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = mutations.len()))]
    async fn mutate(&self, mutations: &[Mutation]) -> StorageResult<Vec<i64>> {
        tokio::time::timeout(self.timeout, self.run_mutations(mutations))
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn params() -> Params {
        Params::new()
            .bind("@key", "a")
            .bind("@version", 3i64)
            .bind("@unused", "x")
    }

    #[test]
    fn should_number_placeholders_in_first_use_order() {
        // when
        let params = params();
        let (sql, values) = bind_positional(
            "select 1 from kv where key = @key::text and (@version::bigint = -1 or version = @version::bigint)",
            &params,
        )
        .unwrap();

        // then
        assert_eq!(
            sql,
            "select 1 from kv where key = $1::text and ($2::bigint = -1 or version = $2::bigint)"
        );
        assert_eq!(
            values,
            vec![&SqlValue::Text("a".into()), &SqlValue::Integer(3)]
        );
    }

    #[rstest]
    #[case("select '@key' from kv", "select '@key' from kv")]
    #[case("select \"@key\" from kv", "select \"@key\" from kv")]
    #[case("select 1 @ 2", "select 1 @ 2")]
    fn should_leave_quoted_and_bare_at_signs_alone(#[case] sql: &str, #[case] expected: &str) {
        // when
        let params = params();
        let (rewritten, values) = bind_positional(sql, &params).unwrap();

        // then
        assert_eq!(rewritten, expected);
        assert!(values.is_empty());
    }

    #[test]
    fn should_fail_on_unbound_placeholder() {
        // when
        let params = params();
        let result = bind_positional("delete from kv where key = @missing", &params);

        // then
        assert_eq!(
            result.unwrap_err(),
            StorageError::Internal("no value bound for @missing".to_string())
        );
    }

    #[rstest]
    #[case(SqlValue::Integer(7), Type::INT8, Some(vec![0, 0, 0, 0, 0, 0, 0, 7]))]
    #[case(SqlValue::Integer(7), Type::INT4, Some(vec![0, 0, 0, 7]))]
    #[case(SqlValue::Text("ab".into()), Type::TEXT, Some(b"ab".to_vec()))]
    #[case(SqlValue::Null, Type::TEXT, None)]
    fn should_encode_values_for_column_type(
        #[case] value: SqlValue,
        #[case] ty: Type,
        #[case] expected: Option<Vec<u8>>,
    ) {
        // when
        let mut out = BytesMut::new();
        let is_null = value.to_sql(&ty, &mut out).unwrap();

        // then
        match expected {
            Some(bytes) => {
                assert!(matches!(is_null, IsNull::No));
                assert_eq!(out.to_vec(), bytes);
            }
            None => assert!(matches!(is_null, IsNull::Yes)),
        }
    }

    #[test]
    fn should_refuse_text_for_integer_parameter() {
        // when
        let result = SqlValue::Text("1".into()).to_sql(&Type::INT8, &mut BytesMut::new());

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_refuse_integer_that_does_not_fit_column() {
        // when
        let result = SqlValue::Integer(1 << 40).to_sql(&Type::INT4, &mut BytesMut::new());

        // then
        assert!(result.is_err());
    }

    #[test]
    fn should_format_timestamps_like_sqlite_rows() {
        // given
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);

        // then
        assert_eq!(format_timestamp(ts), "2024-01-01T00:00:00.123456000Z");
    }

    #[tokio::test]
    async fn should_report_unreachable_server_as_storage_error() {
        // given
        let mut config = PostgresStorageConfig::new("host=127.0.0.1 port=1 user=kv");
        config.timeout = Duration::from_secs(5);
        let backend = PostgresBackend::new(&config).unwrap();

        // when
        let result = backend.mutate(&[Mutation::new("select 1", Params::new())]).await;

        // then
        assert!(matches!(result, Err(StorageError::Storage(msg)) if msg.contains("connect")));
    }
}
