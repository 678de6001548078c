//! Embedded SQLite engine.
//!
//! Statements run on a small pool of connections, each call on a blocking
//! thread. Dropping the future of an in-flight call cancels it: statements
//! that have not started yet are skipped and the open transaction is rolled
//! back.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, TransactionBehavior};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::config::SqliteStorageConfig;
use super::{
    Mutation, ParamStyle, Params, Query, Row, SqlBackend, SqlValue, StorageError, StorageResult,
};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(v) => ValueRef::Integer(*v),
            SqlValue::Real(v) => ValueRef::Real(*v),
            SqlValue::Text(v) => ValueRef::Text(v.as_bytes()),
            SqlValue::Blob(v) => ValueRef::Blob(v),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

fn read_value(value: ValueRef<'_>) -> StorageResult<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Real(v),
        ValueRef::Text(v) => SqlValue::Text(
            std::str::from_utf8(v)
                .map_err(|e| {
                    StorageError::Internal(format!("invalid utf-8 in text column: {}", e))
                })?
                .to_string(),
        ),
        ValueRef::Blob(v) => SqlValue::Blob(bytes::Bytes::copy_from_slice(v)),
    })
}

enum Location {
    /// Private database that lives as long as its only connection.
    Memory,
    File {
        path: PathBuf,
        busy_timeout: Duration,
    },
}

impl Location {
    fn open(&self) -> StorageResult<Connection> {
        match self {
            Location::Memory => Connection::open_in_memory().map_err(|e| {
                StorageError::Storage(format!("Failed to open in-memory SQLite: {}", e))
            }),
            Location::File { path, busy_timeout } => {
                let conn = Connection::open(path).map_err(|e| {
                    StorageError::Storage(format!(
                        "Failed to open SQLite database '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                conn.busy_timeout(*busy_timeout)
                    .map_err(StorageError::from_storage)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")
                    .map_err(StorageError::from_storage)?;
                Ok(conn)
            }
        }
    }
}

struct ConnectionPool {
    location: Location,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    fn checkout(&self) -> StorageResult<Connection> {
        let conn = self
            .idle
            .lock()
            .map_err(|_| StorageError::Internal("connection pool lock poisoned".to_string()))?
            .pop();
        match (conn, &self.location) {
            (Some(conn), _) => Ok(conn),
            (None, Location::File { .. }) => self.location.open(),
            (None, Location::Memory) => Err(StorageError::Internal(
                "in-memory connection was lost".to_string(),
            )),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// SQLite implementation of [`SqlBackend`].
#[derive(Clone)]
pub struct SqliteBackend {
    pool: Arc<ConnectionPool>,
}

impl SqliteBackend {
    /// Opens a private in-memory database.
    pub fn in_memory() -> StorageResult<Self> {
        Self::with_location(Location::Memory, 1)
    }

    /// Opens, creating if needed, the database file named by `config`.
    pub fn open(config: &SqliteStorageConfig) -> StorageResult<Self> {
        if config.pool_size == 0 {
            return Err(StorageError::Storage(
                "pool_size must be greater than zero".to_string(),
            ));
        }
        let location = Location::File {
            path: PathBuf::from(&config.path),
            busy_timeout: config.busy_timeout,
        };
        Self::with_location(location, config.pool_size)
    }

    fn with_location(location: Location, size: usize) -> StorageResult<Self> {
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(location.open()?);
        }
        Ok(Self {
            pool: Arc::new(ConnectionPool {
                location,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(size)),
            }),
        })
    }

    /// Runs `f` on a pooled connection on the blocking thread pool.
    ///
    /// The connection and its permit return to the pool from the blocking
    /// thread, so a caller that stops waiting never leaks either.
    async fn with_connection<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &CancellationToken) -> StorageResult<T> + Send + 'static,
    {
        let permit = self
            .pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Internal("connection pool closed".to_string()))?;
        let mut conn = self.pool.checkout()?;
        let pool = Arc::clone(&self.pool);
        let token = CancellationToken::new();
        let cancel_on_drop = token.clone().drop_guard();
        let task = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn, &token);
            pool.checkin(conn);
            drop(permit);
            result
        });
        let result = task
            .await
            .map_err(|e| StorageError::Internal(format!("sqlite task failed: {}", e)))?;
        cancel_on_drop.disarm();
        result
    }
}

fn check_cancelled(token: &CancellationToken) -> StorageResult<()> {
    if token.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

fn prepare<'c>(
    conn: &'c Connection,
    sql: &str,
    params: &Params,
) -> StorageResult<rusqlite::CachedStatement<'c>> {
    let mut stmt = conn.prepare_cached(sql).map_err(StorageError::from_storage)?;
    for (name, value) in params.iter() {
        // Names the statement never references are ignored.
        if let Some(index) = stmt
            .parameter_index(name)
            .map_err(StorageError::from_storage)?
        {
            stmt.raw_bind_parameter(index, value)
                .map_err(StorageError::from_storage)?;
        }
    }
    Ok(stmt)
}

fn run_query(conn: &Connection, query: &Query) -> StorageResult<Vec<Row>> {
    let mut stmt = prepare(conn, &query.sql, &query.params)?;
    let columns = stmt.column_count();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(StorageError::from_storage)? {
        let mut values = Vec::with_capacity(columns);
        for i in 0..columns {
            values.push(read_value(row.get_ref(i).map_err(StorageError::from_storage)?)?);
        }
        out.push(Row::new(values));
    }
    Ok(out)
}

fn run_mutation(conn: &Connection, mutation: &Mutation) -> StorageResult<i64> {
    let mut stmt = prepare(conn, &mutation.sql, &mutation.params)?;
    let affected = stmt.raw_execute().map_err(StorageError::from_storage)?;
    Ok(affected as i64)
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Colon
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = queries.len()))]
    async fn query(&self, queries: &[Query]) -> StorageResult<Vec<Vec<Row>>> {
        let queries = queries.to_vec();
        self.with_connection(move |conn, token| {
            // One read transaction so every query sees the same snapshot.
            let tx = conn.transaction().map_err(StorageError::from_storage)?;
            let mut outputs = Vec::with_capacity(queries.len());
            for query in &queries {
                check_cancelled(token)?;
                outputs.push(run_query(&tx, query)?);
            }
            tx.commit().map_err(StorageError::from_storage)?;
            Ok(outputs)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(statements = mutations.len()))]
    async fn mutate(&self, mutations: &[Mutation]) -> StorageResult<Vec<i64>> {
        let mutations = mutations.to_vec();
        self.with_connection(move |conn, token| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(StorageError::from_storage)?;
            let mut affected = Vec::with_capacity(mutations.len());
            for (index, mutation) in mutations.iter().enumerate() {
                check_cancelled(token)?;
                let rows = run_mutation(&tx, mutation)?;
                match mutation.expected_rows {
                    Some(expected) if rows != expected => {
                        tracing::debug!(
                            index,
                            expected,
                            rows,
                            "rolling back on row count mismatch"
                        );
                        tx.rollback().map_err(StorageError::from_storage)?;
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
            check_cancelled(token)?;
            tx.commit().map_err(StorageError::from_storage)?;
            Ok(affected)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = "create table if not exists t (k text primary key, n integer)";

    fn insert(k: &str, n: i64) -> Mutation {
        Mutation::new(
            "insert into t (k, n) values (:k, :n)",
            Params::new().bind(":k", k).bind(":n", n),
        )
    }

    fn select_all() -> Query {
        Query::new("select k, n from t order by k", Params::new())
    }

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend
            .mutate(&[Mutation::new(SCHEMA, Params::new())])
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn should_return_rows_in_select_order() {
        // given
        let backend = backend().await;
        backend.mutate(&[insert("b", 2), insert("a", 1)]).await.unwrap();

        // when
        let outputs = backend.query(&[select_all()]).await.unwrap();

        // then
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0],
            vec![
                Row::new(vec![SqlValue::Text("a".into()), SqlValue::Integer(1)]),
                Row::new(vec![SqlValue::Text("b".into()), SqlValue::Integer(2)]),
            ]
        );
    }

    #[tokio::test]
    async fn should_report_rows_affected_per_mutation() {
        // given
        let backend = backend().await;
        backend.mutate(&[insert("a", 1), insert("b", 2)]).await.unwrap();

        // when
        let affected = backend
            .mutate(&[
                Mutation::new("update t set n = n + 1", Params::new()),
                Mutation::new("delete from t where k = 'missing'", Params::new()),
            ])
            .await
            .unwrap();

        // then
        assert_eq!(affected, vec![2, 0]);
    }

    #[tokio::test]
    async fn should_roll_back_everything_on_statement_error() {
        // given
        let backend = backend().await;
        backend.mutate(&[insert("a", 1)]).await.unwrap();

        // when
        let result = backend.mutate(&[insert("b", 2), insert("a", 3)]).await;

        // then
        assert!(matches!(result, Err(StorageError::Storage(_))));
        let rows = backend.query(&[select_all()]).await.unwrap();
        assert_eq!(rows[0].len(), 1);
    }

    #[tokio::test]
    async fn should_roll_back_when_expected_rows_differ() {
        // given
        let backend = backend().await;
        backend.mutate(&[insert("a", 1)]).await.unwrap();

        // when
        let result = backend
            .mutate(&[
                insert("b", 2),
                Mutation::new("update t set n = 9 where k = 'missing'", Params::new())
                    .expect_rows(1),
            ])
            .await;

        // then
        assert_eq!(
            result,
            Err(StorageError::Precondition {
                index: 1,
                expected: 1,
                actual: Some(0)
            })
        );
        let rows = backend.query(&[select_all()]).await.unwrap();
        assert_eq!(rows[0].len(), 1);
    }

    #[tokio::test]
    async fn should_ignore_params_the_statement_does_not_use() {
        // given
        let backend = backend().await;
        let query = Query::new(
            "select count(*) from t",
            Params::new().bind(":unused", "x"),
        );

        // when
        let count = backend.query_scalar_i64(&query).await.unwrap();

        // then
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn should_skip_remaining_statements_when_call_is_dropped() {
        // given
        let backend = backend().await;
        let slow = Mutation::new(
            "insert into t (k, n) select 'slow', count(*) from \
             (with recursive c(x) as (select 1 union all select x + 1 from c where x < 5000000) \
             select x from c)",
            Params::new(),
        );

        // when
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            backend.mutate(&[slow, insert("fast", 42)]),
        )
        .await;

        // then
        assert!(result.is_err());
        let count = backend
            .query_scalar_i64(&Query::new("select count(*) from t", Params::new()))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn should_share_file_database_across_pooled_connections() {
        // given
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db");
        let config = SqliteStorageConfig::new(path.to_string_lossy());
        let backend = SqliteBackend::open(&config).unwrap();
        backend
            .mutate(&[Mutation::new(SCHEMA, Params::new())])
            .await
            .unwrap();

        // when
        let writes = (0..8).map(|i| {
            let backend = backend.clone();
            tokio::spawn(async move { backend.mutate(&[insert(&format!("k{}", i), i)]).await })
        });
        for write in writes {
            write.await.unwrap().unwrap();
        }

        // then
        let count = backend
            .query_scalar_i64(&Query::new("select count(*) from t", Params::new()))
            .await
            .unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn should_reject_empty_pool() {
        // given
        let mut config = SqliteStorageConfig::new("unused.db");
        config.pool_size = 0;

        // when
        let result = SqliteBackend::open(&config);

        // then
        assert!(matches!(result, Err(StorageError::Storage(_))));
    }
}
