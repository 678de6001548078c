//! Statements for PostgreSQL.
//!
//! The schema matches the SQLite one column for column, with `created` as a
//! `timestamptz`. Parameters are written `@name` and every one carries an
//! explicit cast, so the server never has to guess a parameter type.
//!
//! `jsonb ||` only merges the top level, so `init` also installs
//! `kv_merge_patch`, a recursive RFC 7396 merge.

use std::sync::Arc;

use common::{Clock, Mutation, ParamStyle, Params, Query};
use serde_json::Value;

use super::{Binder, Dialect, KeyFilter, PutPatch, encode_json, version_guard};
use crate::error::Result;
use crate::model::format_created;

const CREATE_TABLE_SQL: &str = "create table if not exists kv (key text primary key, version integer, value jsonb, created timestamptz);";
const CREATE_KEY_INDEX_SQL: &str = "create index if not exists kv_key on kv(key);";
const CREATE_CREATED_INDEX_SQL: &str = "create index if not exists kv_created on kv(created);";

const CREATE_MERGE_PATCH_SQL: &str = "create or replace function kv_merge_patch(target jsonb, patch jsonb) returns jsonb
language plpgsql immutable as $$
declare
    result jsonb;
    item record;
begin
    if patch is null or jsonb_typeof(patch) <> 'object' then
        return patch;
    end if;
    if target is null or jsonb_typeof(target) <> 'object' then
        result := '{}'::jsonb;
    else
        result := target;
    end if;
    for item in select key, value from jsonb_each(patch) loop
        if jsonb_typeof(item.value) = 'null' then
            result := result - item.key;
        else
            result := jsonb_set(result, array[item.key], kv_merge_patch(result -> item.key, item.value));
        end if;
    end loop;
    return result;
end;
$$;";

const SELECT_RECORD_SQL: &str = "select key, version, value, created from kv";

/// Keys compare byte by byte, as they do in SQLite, whatever the database
/// collation.
const KEY_ORDER_SQL: &str = "order by key collate \"C\"";

/// Postgres rejects a negative limit.
const NO_LIMIT: i64 = i64::MAX;

fn where_clause(filter: &KeyFilter<'_>) -> &'static str {
    match filter {
        KeyFilter::All => "",
        KeyFilter::Prefix(_) => " where starts_with(key, @prefix::text)",
        KeyFilter::Range(_, _) => {
            " where key collate \"C\" >= @from::text and key collate \"C\" < @to::text"
        }
    }
}

/// The version check repeated against the row locked by `on conflict`, so
/// a concurrent writer that got there first fails the check.
fn conflict_guard(version: &str) -> String {
    format!("where {v} = -1 or kv.version = {v}", v = version)
}

/// Dialect for PostgreSQL.
pub struct PostgresDialect {
    clock: Arc<dyn Clock>,
}

impl PostgresDialect {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn binder(&self) -> Binder {
        Binder::new(ParamStyle::At)
    }

    fn now(&self) -> String {
        format_created(self.clock.now())
    }

    fn scan(&self, filter: KeyFilter<'_>, offset: usize, limit: Option<usize>) -> Query {
        let sql = format!(
            "{}{} {} limit @limit::bigint offset @offset::bigint",
            SELECT_RECORD_SQL,
            where_clause(&filter),
            KEY_ORDER_SQL
        );
        let params = self
            .binder()
            .filter(&filter)
            .page(offset, limit, NO_LIMIT)
            .params;
        Query::new(sql, params)
    }

    fn delete_page(&self, filter: KeyFilter<'_>, offset: usize, limit: Option<usize>) -> Mutation {
        let sql = format!(
            "delete from kv where key in (select key from kv{} {} limit @limit::bigint offset @offset::bigint)",
            where_clause(&filter),
            KEY_ORDER_SQL
        );
        let params = self
            .binder()
            .filter(&filter)
            .page(offset, limit, NO_LIMIT)
            .params;
        Mutation::new(sql, params)
    }

    fn count_where(&self, filter: KeyFilter<'_>) -> Query {
        let sql = format!("select count(*) from kv{}", where_clause(&filter));
        Query::new(sql, self.binder().filter(&filter).params)
    }

    fn write(
        &self,
        op: &str,
        key: &str,
        version: i64,
        value: &Value,
        update_sql: &str,
    ) -> Result<Mutation> {
        let sql = format!(
            "insert into kv (key, version, value, created) \
             select @key::text, 1, @value::text::jsonb, @now::text::timestamptz \
             where {} \
             on conflict (key) do update set version = kv.version + 1, value = {} {}",
            version_guard("@key::text", "@version::bigint"),
            update_sql,
            conflict_guard("@version::bigint")
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

impl Dialect for PostgresDialect {
    fn init(&self) -> Vec<Mutation> {
        [
            CREATE_TABLE_SQL,
            CREATE_KEY_INDEX_SQL,
            CREATE_CREATED_INDEX_SQL,
            CREATE_MERGE_PATCH_SQL,
        ]
        .into_iter()
        .map(|sql| Mutation::new(sql, Params::new()))
        .collect()
    }

    fn get(&self, key: &str) -> Query {
        Query::new(
            format!("{} where key = @key::text", SELECT_RECORD_SQL),
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
        self.write("put", key, version, value, "excluded.value")
    }

    fn patch(&self, key: &str, version: i64, patch: &Value) -> Result<Mutation> {
        self.write(
            "patch",
            key,
            version,
            patch,
            "kv_merge_patch(kv.value, excluded.value)",
        )
    }

    fn put_patches(&self, writes: &[PutPatch]) -> Result<Mutation> {
        let sql = format!(
            "insert into kv (key, version, value, created) \
             select w.key, 1, \
             case w.operation \
             when 'patch' then coalesce((select kv_merge_patch(kv.value, w.value) from kv where kv.key = w.key), w.value) \
             else w.value end, \
             @now::text::timestamptz \
             from jsonb_to_recordset(@writes::text::jsonb) as w(key text, version bigint, value jsonb, operation text) \
             where {guard} \
             on conflict (key) do update set version = kv.version + 1, value = excluded.value \
             where exists (select 1 from jsonb_to_recordset(@writes::text::jsonb) as c(key text, version bigint) \
             where c.key = excluded.key and (c.version = -1 or c.version = kv.version))",
            guard = version_guard("w.key", "w.version"),
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
            "delete from kv where key = @key::text",
            self.binder().bind("key", key).params,
        )
    }

    fn delete_keys(&self, keys: &[String]) -> Result<Mutation> {
        Ok(Mutation::new(
            "delete from kv where key in (select jsonb_array_elements_text(@keys::text::jsonb))",
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
    use serde_json::json;

    use super::*;
    use crate::statements::WriteKind;

    fn dialect() -> PostgresDialect {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        PostgresDialect::new(Arc::new(clock))
    }

    #[test]
    fn should_create_schema_and_merge_function() {
        // when
        let init = dialect().init();

        // then
        assert_eq!(init.len(), 4);
        assert_eq!(init[0].sql, CREATE_TABLE_SQL);
        assert!(init[0].sql.contains("created timestamptz"));
        assert!(init[3].sql.starts_with("create or replace function kv_merge_patch"));
    }

    #[test]
    fn should_spell_params_with_at_sign() {
        // when
        let query = dialect().get("users/1");

        // then
        assert_eq!(
            query.sql,
            "select key, version, value, created from kv where key = @key::text"
        );
        assert_eq!(
            query.params.get("@key"),
            Some(&SqlValue::Text("users/1".into()))
        );
    }

    #[test]
    fn should_match_prefix_literally() {
        // when
        let query = dialect().get_prefix("a%_", 2, Some(5));

        // then
        assert_eq!(
            query.sql,
            "select key, version, value, created from kv where starts_with(key, @prefix::text) \
             order by key collate \"C\" limit @limit::bigint offset @offset::bigint"
        );
        assert_eq!(
            query.params.get("@prefix"),
            Some(&SqlValue::Text("a%_".into()))
        );
        assert_eq!(query.params.get("@limit"), Some(&SqlValue::Integer(5)));
        assert_eq!(query.params.get("@offset"), Some(&SqlValue::Integer(2)));
    }

    #[test]
    fn should_bind_missing_limit_as_largest_bigint() {
        // when
        let query = dialect().list(0, None);

        // then
        assert_eq!(query.params.get("@limit"), Some(&SqlValue::Integer(i64::MAX)));
    }

    #[test]
    fn should_compare_ranges_bytewise() {
        // when
        let count = dialect().count_range("a", "c");

        // then
        assert_eq!(
            count.sql,
            "select count(*) from kv where key collate \"C\" >= @from::text and key collate \"C\" < @to::text"
        );
    }

    #[test]
    fn should_recheck_version_on_conflict() {
        // when
        let mutation = dialect().put("a", 3, &json!({"n": 1})).unwrap();

        // then
        assert!(mutation.sql.contains("@value::text::jsonb, @now::text::timestamptz"));
        assert!(mutation.sql.contains(&version_guard("@key::text", "@version::bigint")));
        assert!(mutation.sql.ends_with(
            "value = excluded.value where @version::bigint = -1 or kv.version = @version::bigint"
        ));
        assert_eq!(mutation.params.get("@version"), Some(&SqlValue::Integer(3)));
        assert_eq!(
            mutation.params.get("@now"),
            Some(&SqlValue::Text("2024-01-01T00:00:00.000000000Z".into()))
        );
    }

    #[test]
    fn should_merge_patch_against_locked_row() {
        // when
        let mutation = dialect().patch("a", -1, &json!({"b": null})).unwrap();

        // then
        assert!(mutation.sql.contains("value = kv_merge_patch(kv.value, excluded.value)"));
        assert_eq!(
            mutation.params.get("@value"),
            Some(&SqlValue::Text(r#"{"b":null}"#.into()))
        );
    }

    #[test]
    fn should_read_batched_writes_as_record_set() {
        // given
        let writes = vec![PutPatch {
            key: "a".into(),
            version: 0,
            value: json!(1),
            kind: WriteKind::Put,
        }];

        // when
        let mutation = dialect().put_patches(&writes).unwrap();

        // then
        assert!(mutation.sql.contains(
            "from jsonb_to_recordset(@writes::text::jsonb) as w(key text, version bigint, value jsonb, operation text)"
        ));
        assert!(mutation.sql.contains("c.version = -1 or c.version = kv.version"));
        assert_eq!(
            mutation.params.get("@writes"),
            Some(&SqlValue::Text(
                r#"[{"key":"a","version":0,"value":1,"operation":"put"}]"#.into()
            ))
        );
    }

    #[test]
    fn should_delete_listed_keys_from_json_array() {
        // when
        let mutation = dialect()
            .delete_keys(&["a".to_string(), "b".to_string()])
            .unwrap();

        // then
        assert_eq!(
            mutation.sql,
            "delete from kv where key in (select jsonb_array_elements_text(@keys::text::jsonb))"
        );
        assert_eq!(
            mutation.params.get("@keys"),
            Some(&SqlValue::Text(r#"["a","b"]"#.into()))
        );
    }

    #[test]
    fn should_delete_through_paged_selection() {
        // when
        let mutation = dialect().delete_prefix("tmp/", 0, Some(10));

        // then
        assert_eq!(
            mutation.sql,
            "delete from kv where key in (select key from kv where starts_with(key, @prefix::text) \
             order by key collate \"C\" limit @limit::bigint offset @offset::bigint)"
        );
    }
}
