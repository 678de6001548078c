//! The store facade.

use std::sync::Arc;

use common::{Mutation, Params, Query, SqlBackend, StorageError, SystemClock, create_backend};
use serde::Serialize;
use serde_json::Value;

use crate::batch::{self, Operation, delete_prefix_target};
use crate::config::Config;
use crate::error::{Error, Result, VersionMismatch};
use crate::model::{PutInput, Record, check_version};
use crate::statements::{Dialect, dialect_for};

/// A versioned key-value store backed by a SQL engine.
///
/// Every write takes a version token: `-1` ([`ANY_VERSION`]) writes
/// unconditionally, `0` ([`NEW_KEY`]) only creates, and `v > 0` only
/// replaces a record currently at version `v`. A write that fails its check
/// returns [`Error::VersionMismatch`] and changes nothing.
///
/// Nothing is cached between calls, so concurrent writers on the same key
/// are arbitrated by the engine: of two writes carrying the same `v`, exactly
/// one succeeds.
///
/// Calls are cancelled by dropping their future, e.g. through
/// `tokio::time::timeout`. Statements not yet started are skipped and the
/// transaction is rolled back.
///
/// # Example
///
/// ```ignore
/// use sqlkv::{Config, KvStore, NEW_KEY};
///
/// let store = KvStore::open(Config::default()).await?;
/// store.init().await?;
///
/// store.put("users/1", NEW_KEY, &json!({"name": "alice"})).await?;
/// let record = store.get("users/1").await?.expect("just written");
/// store.patch("users/1", record.version, &json!({"age": 30})).await?;
/// ```
///
/// [`ANY_VERSION`]: crate::ANY_VERSION
/// [`NEW_KEY`]: crate::NEW_KEY
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn SqlBackend>,
    dialect: Arc<dyn Dialect>,
}

impl KvStore {
    /// Opens a store on the backend described by `config`.
    ///
    /// Does not create the schema; call [`KvStore::init`] for that.
    pub async fn open(config: Config) -> Result<Self> {
        let backend = create_backend(&config.storage).map_err(|e| Error::storage("open", e))?;
        let dialect = dialect_for(backend.param_style(), SystemClock::shared());
        Ok(Self::new(backend, dialect))
    }

    /// Creates a store from an existing backend and dialect.
    pub fn new(backend: Arc<dyn SqlBackend>, dialect: Arc<dyn Dialect>) -> Self {
        Self { backend, dialect }
    }

    /// The engine this store runs against.
    pub fn backend(&self) -> &Arc<dyn SqlBackend> {
        &self.backend
    }

    /// Creates the table and indexes if they do not exist. Safe to repeat.
    pub async fn init(&self) -> Result<()> {
        self.backend
            .mutate(&self.dialect.init())
            .await
            .map_err(|e| Error::storage("init", e))?;
        Ok(())
    }

    /// Reads one record. A missing key is `Ok(None)`.
    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let mut records = self.query_records("get", self.dialect.get(key)).await?;
        match records.len() {
            0 => Ok(None),
            1 => Ok(records.pop()),
            n => Err(Error::Internal(format!(
                "get: {} rows found for key {:?}",
                n, key
            ))),
        }
    }

    /// Records whose key starts with `prefix`, in key order.
    ///
    /// An empty prefix matches every key. `limit: None` reads to the end.
    pub async fn get_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        self.query_records("getprefix", self.dialect.get_prefix(prefix, offset, limit))
            .await
    }

    /// Records with `from <= key < to`, in key order.
    pub async fn get_range(
        &self,
        from: &str,
        to: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<Record>> {
        self.query_records("getrange", self.dialect.get_range(from, to, offset, limit))
            .await
    }

    /// All records, in key order.
    pub async fn list(&self, offset: usize, limit: Option<usize>) -> Result<Vec<Record>> {
        self.query_records("list", self.dialect.list(offset, limit))
            .await
    }

    /// Writes `value` under `key`, subject to the `version` check.
    pub async fn put<T: Serialize + ?Sized>(
        &self,
        key: &str,
        version: i64,
        value: &T,
    ) -> Result<()> {
        check_version("put", key, version)?;
        let value = to_json("put", value)?;
        let mutation = self.dialect.put(key, version, &value)?;
        self.write_one("put", key, version, mutation).await
    }

    /// Merges `patch` into the stored value (RFC 7396), subject to the
    /// `version` check. Object members set to `null` are removed.
    pub async fn patch<T: Serialize + ?Sized>(
        &self,
        key: &str,
        version: i64,
        patch: &T,
    ) -> Result<()> {
        check_version("patch", key, version)?;
        let patch = to_json("patch", patch)?;
        let mutation = self.dialect.patch(key, version, &patch)?;
        self.write_one("patch", key, version, mutation).await
    }

    /// Writes all inputs atomically. If any input fails its version check,
    /// nothing is written.
    pub async fn put_all(&self, inputs: Vec<PutInput>) -> Result<()> {
        let ops: Vec<Operation> = inputs
            .into_iter()
            .map(|input| Operation::put(input.key, input.version, input.value))
            .collect();
        self.mutate_all(&ops).await?;
        Ok(())
    }

    /// Deletes one key. Returns the number of rows removed, 0 if absent.
    pub async fn delete(&self, key: &str) -> Result<i64> {
        self.mutate_one("delete", self.dialect.delete(key)).await
    }

    /// Deletes every listed key that exists.
    pub async fn delete_keys<S: AsRef<str>>(&self, keys: &[S]) -> Result<i64> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let mutation = self.dialect.delete_keys(&keys)?;
        self.mutate_one("deletekeys", mutation).await
    }

    /// Deletes the records [`KvStore::get_prefix`] would return.
    ///
    /// The empty prefix is rejected; pass [`ALL_KEYS`](crate::ALL_KEYS) to
    /// delete everything.
    pub async fn delete_prefix(
        &self,
        prefix: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<i64> {
        let prefix = delete_prefix_target("deleteprefix", prefix)?;
        self.mutate_one(
            "deleteprefix",
            self.dialect.delete_prefix(prefix, offset, limit),
        )
        .await
    }

    /// Deletes the records [`KvStore::get_range`] would return.
    pub async fn delete_range(
        &self,
        from: &str,
        to: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<i64> {
        self.mutate_one(
            "deleterange",
            self.dialect.delete_range(from, to, offset, limit),
        )
        .await
    }

    pub async fn count(&self) -> Result<i64> {
        self.query_count("count", self.dialect.count()).await
    }

    pub async fn count_prefix(&self, prefix: &str) -> Result<i64> {
        self.query_count("countprefix", self.dialect.count_prefix(prefix))
            .await
    }

    pub async fn count_range(&self, from: &str, to: &str) -> Result<i64> {
        self.query_count("countrange", self.dialect.count_range(from, to))
            .await
    }

    /// Runs a batch of operations in one transaction and returns the total
    /// number of rows affected.
    ///
    /// Puts and patches must target distinct keys. If any of them fails its
    /// version check, the whole batch is rolled back, deletes included, and
    /// the error lists every put/patch key with the token it carried.
    pub async fn mutate_all(&self, operations: &[Operation]) -> Result<i64> {
        if operations.is_empty() {
            return Ok(0);
        }
        let plan = batch::plan(self.dialect.as_ref(), operations)?;
        match self.backend.mutate(&plan.mutations).await {
            Ok(affected) => {
                let total: i64 = affected.iter().sum();
                tracing::debug!(
                    statements = plan.mutations.len(),
                    rows = total,
                    "batch committed"
                );
                Ok(total)
            }
            Err(StorageError::Precondition { index, .. })
                if Some(index) == plan.put_patch_index =>
            {
                tracing::warn!(
                    keys = plan.versions.len(),
                    "batch rolled back on version mismatch"
                );
                Err(Error::VersionMismatch(VersionMismatch {
                    keys: plan.versions,
                }))
            }
            Err(e) => Err(Error::storage("mutateall", e)),
        }
    }

    /// Runs a raw row-returning statement whose columns are
    /// `key, version, value, created`.
    ///
    /// Parameter names must be spelled for the backend, see
    /// [`SqlBackend::param_style`].
    pub async fn query(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        self.query_records("query", Query::new(sql, params)).await
    }

    /// Runs a raw data-modifying statement and returns rows affected.
    pub async fn mutate(&self, sql: &str, params: Params) -> Result<i64> {
        self.mutate_one("mutate", Mutation::new(sql, params)).await
    }

    async fn query_records(&self, op: &str, query: Query) -> Result<Vec<Record>> {
        let mut outputs = self
            .backend
            .query(std::slice::from_ref(&query))
            .await
            .map_err(|e| Error::storage(op, e))?;
        let rows = outputs
            .pop()
            .ok_or_else(|| Error::Internal(format!("{}: no result returned", op)))?;
        rows.iter().map(Record::from_row).collect()
    }

    async fn query_count(&self, op: &str, query: Query) -> Result<i64> {
        self.backend
            .query_scalar_i64(&query)
            .await
            .map_err(|e| Error::storage(op, e))
    }

    async fn mutate_one(&self, op: &str, mutation: Mutation) -> Result<i64> {
        let affected = self
            .backend
            .mutate(std::slice::from_ref(&mutation))
            .await
            .map_err(|e| Error::storage(op, e))?;
        affected
            .first()
            .copied()
            .ok_or_else(|| Error::Internal(format!("{}: no result returned", op)))
    }

    async fn write_one(&self, op: &str, key: &str, version: i64, mutation: Mutation) -> Result<()> {
        if self.mutate_one(op, mutation).await? == 0 {
            tracing::debug!(key, version, "{} lost version check", op);
            return Err(VersionMismatch::single(key, version).into());
        }
        Ok(())
    }
}

fn to_json<T: Serialize + ?Sized>(op: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::InvalidInput(format!("{}: value cannot be encoded as JSON: {}", op, e)))
}
