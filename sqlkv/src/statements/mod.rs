//! SQL generation for the logical store operations.
//!
//! Every operation maps to one statement (or, for `init`, a fixed list) and
//! its named parameters, with no I/O. All statements target a single `kv`
//! table keyed by `key`, with an integer `version`, a JSON `value` and a
//! `created` timestamp.
//!
//! Writes share one version guard. A token of `-1` always passes, `0`
//! passes only when the key is absent, and `v > 0` passes only when the key
//! exists at exactly version `v`. A write whose guard fails touches no row.

mod postgres;
mod sqlite;

use std::sync::Arc;

use common::{Clock, Mutation, ParamStyle, Params, Query, SqlValue, prefix_successor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Whether a batched write replaces or merge-patches the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Put,
    Patch,
}

/// One write of a combined put/patch statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPatch {
    pub key: String,
    pub version: i64,
    pub value: Value,
    #[serde(rename = "operation")]
    pub kind: WriteKind,
}

/// Generates statements for one SQL dialect.
pub trait Dialect: Send + Sync {
    /// Idempotent schema creation.
    fn init(&self) -> Vec<Mutation>;

    fn get(&self, key: &str) -> Query;
    fn get_prefix(&self, prefix: &str, offset: usize, limit: Option<usize>) -> Query;
    /// Keys in `[from, to)`.
    fn get_range(&self, from: &str, to: &str, offset: usize, limit: Option<usize>) -> Query;
    fn list(&self, offset: usize, limit: Option<usize>) -> Query;

    /// Inserts with version 1 or replaces the value and bumps the version,
    /// subject to the version guard.
    fn put(&self, key: &str, version: i64, value: &Value) -> Result<Mutation>;

    /// Like [`Dialect::put`], but merges `patch` into the stored value
    /// (RFC 7396). An absent key starts from the patch document.
    fn patch(&self, key: &str, version: i64, patch: &Value) -> Result<Mutation>;

    /// Applies many puts and patches on distinct keys in one statement, each
    /// under its own version guard. Rows affected is the number of writes
    /// that passed their guard.
    fn put_patches(&self, writes: &[PutPatch]) -> Result<Mutation>;

    fn delete(&self, key: &str) -> Mutation;
    fn delete_keys(&self, keys: &[String]) -> Result<Mutation>;

    /// Deletes exactly the rows [`Dialect::get_prefix`] would return.
    fn delete_prefix(&self, prefix: &str, offset: usize, limit: Option<usize>) -> Mutation;

    /// Deletes exactly the rows [`Dialect::get_range`] would return.
    fn delete_range(&self, from: &str, to: &str, offset: usize, limit: Option<usize>)
    -> Mutation;

    fn count(&self) -> Query;
    fn count_prefix(&self, prefix: &str) -> Query;
    fn count_range(&self, from: &str, to: &str) -> Query;
}

/// Picks the dialect spoken by a backend with the given parameter style.
pub fn dialect_for(style: ParamStyle, clock: Arc<dyn Clock>) -> Arc<dyn Dialect> {
    match style {
        ParamStyle::At => Arc::new(PostgresDialect::new(clock)),
        style => Arc::new(SqliteDialect::new(style, clock)),
    }
}

/// Key predicate shared by scans, paged deletes and counts.
enum KeyFilter<'a> {
    All,
    Prefix(&'a str),
    Range(&'a str, &'a str),
}

/// Builds parameter lists spelled for one engine.
struct Binder {
    style: ParamStyle,
    params: Params,
}

impl Binder {
    fn new(style: ParamStyle) -> Self {
        Self {
            style,
            params: Params::new(),
        }
    }

    fn bind(mut self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.params = self.params.bind(self.style.name(name), value);
        self
    }

    /// Binds paging, with `unbounded` standing in for a missing limit.
    fn page(self, offset: usize, limit: Option<usize>, unbounded: i64) -> Self {
        let limit = limit.map_or(unbounded, to_i64);
        self.bind("limit", limit).bind("offset", to_i64(offset))
    }

    fn filter(self, filter: &KeyFilter<'_>) -> Self {
        match filter {
            KeyFilter::All => self,
            KeyFilter::Prefix(prefix) => self.bind("prefix", *prefix),
            KeyFilter::Range(from, to) => self.bind("from", *from).bind("to", *to),
        }
    }

    /// Like [`Binder::filter`], but also binds the exclusive upper bound of
    /// a prefix, when it has one.
    fn filter_with_bound(self, filter: &KeyFilter<'_>) -> Self {
        match filter {
            KeyFilter::Prefix(prefix) => match prefix_successor(prefix) {
                Some(end) => self.bind("prefix", *prefix).bind("prefix_end", end),
                None => self.bind("prefix", *prefix),
            },
            other => self.filter(other),
        }
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// SQL condition that holds when a write of `key` with token `version`
/// passes its version check. Both arguments are SQL expressions.
fn version_guard(key: &str, version: &str) -> String {
    format!(
        "({v} = -1 \
         or ({v} = 0 and not exists (select 1 from kv where kv.key = {k})) \
         or ({v} > 0 and exists (select 1 from kv where kv.key = {k} and kv.version = {v})))",
        k = key,
        v = version
    )
}

fn encode_json<T: Serialize + ?Sized>(op: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::InvalidInput(format!("{}: value cannot be encoded as JSON: {}", op, e)))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::FixedClock;

    use super::*;

    #[test]
    fn should_pick_dialect_from_param_style() {
        // given
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));

        // when
        let postgres = dialect_for(ParamStyle::At, clock.clone());
        let rqlite = dialect_for(ParamStyle::Bare, clock);

        // then
        assert!(postgres.get("a").params.get("@key").is_some());
        assert!(rqlite.get("a").params.get("key").is_some());
    }

    #[test]
    fn should_guard_all_three_token_kinds() {
        // when
        let guard = version_guard(":key", ":version");

        // then
        assert!(guard.starts_with("(:version = -1 or (:version = 0 and not exists"));
        assert!(guard.contains("kv.key = :key and kv.version = :version"));
    }

    #[test]
    fn should_bind_prefix_bound_only_when_one_exists() {
        // when
        let bounded = Binder::new(ParamStyle::Colon).filter_with_bound(&KeyFilter::Prefix("p/"));
        let unbounded = Binder::new(ParamStyle::Colon).filter_with_bound(&KeyFilter::Prefix(""));

        // then
        assert_eq!(bounded.params.get(":prefix_end"), Some(&SqlValue::Text("p0".into())));
        assert_eq!(unbounded.params.get(":prefix_end"), None);
    }
}
