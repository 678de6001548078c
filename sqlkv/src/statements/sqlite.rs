//! Statements for SQLite and rqlite.
//!
//! The schema is
//!
//! ```sql
//! create table if not exists kv (
//!     key text primary key, version integer, value jsonb, created text
//! ) without rowid;
//! ```
//!
//! Values are bound as JSON text, stored with `jsonb(...)` and read back
//! with `json(...)`.

use std::sync::Arc;

use common::{Clock, Mutation, ParamStyle, Params, Query};
use serde_json::Value;

use super::{Binder, Dialect, KeyFilter, PutPatch, encode_json, version_guard};
use crate::error::Result;
use crate::model::format_created;

const CREATE_TABLE_SQL: &str = "create table if not exists kv (key text primary key, version integer, value jsonb, created text) without rowid;";
const CREATE_KEY_INDEX_SQL: &str = "create index if not exists kv_key on kv(key);";
const CREATE_CREATED_INDEX_SQL: &str = "create index if not exists kv_created on kv(created);";

const SELECT_RECORD_SQL: &str = "select key, version, json(value) as value, created from kv";

const UPSERT_SQL: &str =
    "on conflict(key) do update set version = kv.version + 1, value = excluded.value";

/// SQLite reads a negative limit as no limit.
const NO_LIMIT: i64 = -1;

fn where_clause(filter: &KeyFilter<'_>) -> &'static str {
    match filter {
        KeyFilter::All => "",
        KeyFilter::Prefix(prefix) if common::prefix_successor(prefix).is_some() => {
            " where key >= :prefix and key < :prefix_end"
        }
        KeyFilter::Prefix(_) => " where key >= :prefix",
        KeyFilter::Range(_, _) => " where key >= :from and key < :to",
    }
}

/// Dialect for SQLite and rqlite, which share the SQL text and differ only
/// in how parameter names are spelled.
///
/// Prefixes are matched as the half-open key range `[prefix, successor)`
/// rather than with `LIKE`, which would treat `%` and `_` as wildcards and
/// ignore ASCII case.
pub struct SqliteDialect {
    style: ParamStyle,
    clock: Arc<dyn Clock>,
}

impl SqliteDialect {
    pub fn new(style: ParamStyle, clock: Arc<dyn Clock>) -> Self {
        Self { style, clock }
    }

    fn binder(&self) -> Binder {
        Binder::new(self.style)
    }

    fn now(&self) -> String {
        format_created(self.clock.now())
    }

    fn scan(&self, filter: KeyFilter<'_>, offset: usize, limit: Option<usize>) -> Query {
        let sql = format!(
            "{}{} order by key limit :limit offset :offset",
            SELECT_RECORD_SQL,
            where_clause(&filter)
        );
        let params = self
            .binder()
            .filter_with_bound(&filter)
            .page(offset, limit, NO_LIMIT)
            .params;
        Query::new(sql, params)
    }

    fn delete_page(&self, filter: KeyFilter<'_>, offset: usize, limit: Option<usize>) -> Mutation {
        let sql = format!(
            "delete from kv where key in (select key from kv{} order by key limit :limit offset :offset)",
            where_clause(&filter)
        );
        let params = self
            .binder()
            .filter_with_bound(&filter)
            .page(offset, limit, NO_LIMIT)
            .params;
        Mutation::new(sql, params)
    }

    fn count_where(&self, filter: KeyFilter<'_>) -> Query {
        let sql = format!("select count(*) from kv{}", where_clause(&filter));
        Query::new(sql, self.binder().filter_with_bound(&filter).params)
    }

    fn write(
        &self,
        op: &str,
        key: &str,
        version: i64,
        value: &Value,
        value_sql: &str,
    ) -> Result<Mutation> {
        let sql = format!(
            "insert into kv (key, version, value, created) select :key, 1, {}, :now where {} {}",
            value_sql,
            version_guard(":key", ":version"),
            UPSERT_SQL
        );
        let params = self
            .binder()
            .bind("key", key)
            .bind("version", version)
            .bind("value", encode_json(op, value)?)
            .bind("now", self.now())
            .params;
        Ok(Mutation::new(sql, params))
    }
}

impl Dialect for SqliteDialect {
    fn init(&self) -> Vec<Mutation> {
        [CREATE_TABLE_SQL, CREATE_KEY_INDEX_SQL, CREATE_CREATED_INDEX_SQL]
            .into_iter()
            .map(|sql| Mutation::new(sql, Params::new()))
            .collect()
    }

    fn get(&self, key: &str) -> Query {
        Query::new(
            format!("{} where key = :key", SELECT_RECORD_SQL),
            self.binder().bind("key", key).params,
        )
    }

    fn get_prefix(&self, prefix: &str, offset: usize, limit: Option<usize>) -> Query {
        self.scan(KeyFilter::Prefix(prefix), offset, limit)
    }

    fn get_range(&self, from: &str, to: &str, offset: usize, limit: Option<usize>) -> Query {
        self.scan(KeyFilter::Range(from, to), offset, limit)
    }

    fn list(&self, offset: usize, limit: Option<usize>) -> Query {
        self.scan(KeyFilter::All, offset, limit)
    }

    fn put(&self, key: &str, version: i64, value: &Value) -> Result<Mutation> {
        self.write("put", key, version, value, "jsonb(:value)")
    }

    fn patch(&self, key: &str, version: i64, patch: &Value) -> Result<Mutation> {
        self.write(
            "patch",
            key,
            version,
            patch,
            "coalesce((select jsonb_patch(kv.value, jsonb(:value)) from kv where kv.key = :key), jsonb(:value))",
        )
    }

    fn put_patches(&self, writes: &[PutPatch]) -> Result<Mutation> {
        let key = "w.value ->> '$.key'";
        let value = "jsonb(w.value -> '$.value')";
        let sql = format!(
            "insert into kv (key, version, value, created) \
             select {key}, 1, \
             case w.value ->> '$.operation' \
             when 'patch' then coalesce((select jsonb_patch(kv.value, {value}) from kv where kv.key = {key}), {value}) \
             else {value} end, \
             :now \
             from json_each(:writes) as w \
             where {guard} {upsert}",
            key = key,
            value = value,
            guard = version_guard(key, "w.value ->> '$.version'"),
            upsert = UPSERT_SQL,
        );
        let params = self
            .binder()
            .bind("writes", encode_json("putpatches", writes)?)
            .bind("now", self.now())
            .params;
        Ok(Mutation::new(sql, params))
    }

    fn delete(&self, key: &str) -> Mutation {
        Mutation::new(
            "delete from kv where key = :key",
            self.binder().bind("key", key).params,
        )
    }

    fn delete_keys(&self, keys: &[String]) -> Result<Mutation> {
        Ok(Mutation::new(
            "delete from kv where key in (select k.value from json_each(:keys) as k)",
            self.binder()
                .bind("keys", encode_json("deletekeys", keys)?)
                .params,
        ))
    }

    fn delete_prefix(&self, prefix: &str, offset: usize, limit: Option<usize>) -> Mutation {
        self.delete_page(KeyFilter::Prefix(prefix), offset, limit)
    }

    fn delete_range(
        &self,
        from: &str,
        to: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Mutation {
        self.delete_page(KeyFilter::Range(from, to), offset, limit)
    }

    fn count(&self) -> Query {
        self.count_where(KeyFilter::All)
    }

    fn count_prefix(&self, prefix: &str) -> Query {
        self.count_where(KeyFilter::Prefix(prefix))
    }

    fn count_range(&self, from: &str, to: &str) -> Query {
        self.count_where(KeyFilter::Range(from, to))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use common::{FixedClock, SqlValue};
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::statements::WriteKind;

    fn dialect(style: ParamStyle) -> SqliteDialect {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        SqliteDialect::new(style, Arc::new(clock))
    }

    #[test]
    fn should_create_table_and_both_indexes() {
        // when
        let init = dialect(ParamStyle::Colon).init();

        // then
        let sql: Vec<_> = init.iter().map(|m| m.sql.as_str()).collect();
        assert_eq!(
            sql,
            vec![CREATE_TABLE_SQL, CREATE_KEY_INDEX_SQL, CREATE_CREATED_INDEX_SQL]
        );
    }

    #[rstest]
    #[case(ParamStyle::Colon, ":key")]
    #[case(ParamStyle::Bare, "key")]
    fn should_spell_params_for_engine(#[case] style: ParamStyle, #[case] name: &str) {
        // when
        let query = dialect(style).get("users/1");

        // then
        assert!(query.sql.ends_with("where key = :key"));
        assert_eq!(query.params.get(name), Some(&SqlValue::Text("users/1".into())));
    }

    #[test]
    fn should_bind_prefix_as_half_open_range() {
        // when
        let query = dialect(ParamStyle::Colon).get_prefix("p/", 1, Some(2));

        // then
        assert!(query.sql.contains("where key >= :prefix and key < :prefix_end"));
        assert!(query.sql.ends_with("order by key limit :limit offset :offset"));
        assert_eq!(query.params.get(":prefix_end"), Some(&SqlValue::Text("p0".into())));
        assert_eq!(query.params.get(":limit"), Some(&SqlValue::Integer(2)));
        assert_eq!(query.params.get(":offset"), Some(&SqlValue::Integer(1)));
    }

    #[test]
    fn should_leave_empty_prefix_unbounded() {
        // when
        let query = dialect(ParamStyle::Colon).count_prefix("");

        // then
        assert_eq!(query.sql, "select count(*) from kv where key >= :prefix");
        assert_eq!(query.params.get(":prefix_end"), None);
    }

    #[test]
    fn should_bind_missing_limit_as_unbounded() {
        // when
        let query = dialect(ParamStyle::Bare).list(0, None);

        // then
        assert_eq!(query.params.get("limit"), Some(&SqlValue::Integer(-1)));
    }

    #[test]
    fn should_delete_through_paged_selection() {
        // when
        let mutation = dialect(ParamStyle::Colon).delete_range("a", "c", 0, Some(10));

        // then
        assert_eq!(
            mutation.sql,
            "delete from kv where key in (select key from kv where key >= :from and key < :to order by key limit :limit offset :offset)"
        );
    }

    #[test]
    fn should_stamp_writes_with_clock_time() {
        // when
        let mutation = dialect(ParamStyle::Colon)
            .put("a", -1, &json!({"n": 1}))
            .unwrap();

        // then
        assert_eq!(
            mutation.params.get(":now"),
            Some(&SqlValue::Text("2024-01-01T00:00:00.000000000Z".into()))
        );
        assert_eq!(
            mutation.params.get(":value"),
            Some(&SqlValue::Text(r#"{"n":1}"#.into()))
        );
        assert_eq!(mutation.expected_rows, None);
    }

    #[test]
    fn should_encode_batched_writes_as_json_array() {
        // given
        let writes = vec![
            PutPatch {
                key: "a".into(),
                version: 1,
                value: json!({"x": 1}),
                kind: WriteKind::Put,
            },
            PutPatch {
                key: "b".into(),
                version: -1,
                value: json!({"y": null}),
                kind: WriteKind::Patch,
            },
        ];

        // when
        let mutation = dialect(ParamStyle::Bare).put_patches(&writes).unwrap();

        // then
        let SqlValue::Text(encoded) = mutation.params.get("writes").unwrap() else {
            panic!("writes must be bound as text");
        };
        let decoded: Vec<PutPatch> = serde_json::from_str(encoded).unwrap();
        assert_eq!(decoded, writes);
        assert!(encoded.contains(r#""operation":"patch""#));
    }
}
