//! Operations accepted by [`KvStore::mutate_all`](crate::KvStore::mutate_all).

use std::collections::BTreeMap;

use common::Mutation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ALL_KEYS, check_version};
use crate::statements::{Dialect, PutPatch, WriteKind};

/// One operation of an atomic batch.
///
/// Serialized with an `operation` tag, so a batch can be read from JSON:
///
/// ```json
/// [
///   {"operation": "put", "key": "users/1", "version": 0, "value": {"name": "alice"}},
///   {"operation": "delete_prefix", "prefix": "sessions/", "limit": 100}
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Put {
        key: String,
        version: i64,
        value: Value,
    },
    Patch {
        key: String,
        version: i64,
        #[serde(rename = "value")]
        patch: Value,
    },
    Delete {
        key: String,
    },
    DeleteKeys {
        keys: Vec<String>,
    },
    DeletePrefix {
        prefix: String,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    DeleteRange {
        from: String,
        to: String,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl Operation {
    pub fn put(key: impl Into<String>, version: i64, value: Value) -> Self {
        Operation::Put {
            key: key.into(),
            version,
            value,
        }
    }

    pub fn patch(key: impl Into<String>, version: i64, patch: Value) -> Self {
        Operation::Patch {
            key: key.into(),
            version,
            patch,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Operation::Delete { key: key.into() }
    }

    pub fn delete_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::DeleteKeys {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn delete_prefix(prefix: impl Into<String>, offset: usize, limit: Option<usize>) -> Self {
        Operation::DeletePrefix {
            prefix: prefix.into(),
            offset,
            limit,
        }
    }

    pub fn delete_range(
        from: impl Into<String>,
        to: impl Into<String>,
        offset: usize,
        limit: Option<usize>,
    ) -> Self {
        Operation::DeleteRange {
            from: from.into(),
            to: to.into(),
            offset,
            limit,
        }
    }
}

/// Resolves the prefix of a prefix delete.
///
/// The empty prefix is refused; [`ALL_KEYS`] selects every key.
pub(crate) fn delete_prefix_target<'a>(op: &str, prefix: &'a str) -> Result<&'a str> {
    match prefix {
        "" => Err(Error::InvalidInput(format!(
            "{}: prefix cannot be empty, use '{}' to delete all records",
            op, ALL_KEYS
        ))),
        ALL_KEYS => Ok(""),
        prefix => Ok(prefix),
    }
}

/// Statements for one batch, ready to run in a single transaction.
pub(crate) struct BatchPlan {
    pub mutations: Vec<Mutation>,
    /// Position of the combined put/patch statement, if any.
    pub put_patch_index: Option<usize>,
    /// Every put/patch key with the token it was submitted with.
    pub versions: BTreeMap<String, i64>,
}

/// Validates `operations` and turns them into statements.
///
/// Deletes keep their relative order. Puts and patches are combined into one
/// statement placed after them, which must write every one of its rows for
/// the batch to commit.
pub(crate) fn plan(dialect: &dyn Dialect, operations: &[Operation]) -> Result<BatchPlan> {
    let mut writes = Vec::new();
    let mut versions = BTreeMap::new();
    let mut mutations = Vec::new();
    for op in operations {
        match op {
            Operation::Put {
                key,
                version,
                value,
            } => {
                add_write(&mut writes, &mut versions, key, *version, value, WriteKind::Put)?;
            }
            Operation::Patch {
                key,
                version,
                patch,
            } => {
                add_write(&mut writes, &mut versions, key, *version, patch, WriteKind::Patch)?;
            }
            Operation::Delete { key } => mutations.push(dialect.delete(key)),
            Operation::DeleteKeys { keys } => mutations.push(dialect.delete_keys(keys)?),
            Operation::DeletePrefix {
                prefix,
                offset,
                limit,
            } => {
                let prefix = delete_prefix_target("mutateall", prefix)?;
                mutations.push(dialect.delete_prefix(prefix, *offset, *limit));
            }
            Operation::DeleteRange {
                from,
                to,
                offset,
                limit,
            } => mutations.push(dialect.delete_range(from, to, *offset, *limit)),
        }
    }

    let mut put_patch_index = None;
    if !writes.is_empty() {
        let expected = writes.len() as i64;
        mutations.push(dialect.put_patches(&writes)?.expect_rows(expected));
        put_patch_index = Some(mutations.len() - 1);
    }
    Ok(BatchPlan {
        mutations,
        put_patch_index,
        versions,
    })
}

fn add_write(
    writes: &mut Vec<PutPatch>,
    versions: &mut BTreeMap<String, i64>,
    key: &str,
    version: i64,
    value: &Value,
    kind: WriteKind,
) -> Result<()> {
    check_version("mutateall", key, version)?;
    if versions.insert(key.to_string(), version).is_some() {
        return Err(Error::InvalidInput(format!(
            "mutateall: cannot put/patch key {:?} multiple times in one operation",
            key
        )));
    }
    writes.push(PutPatch {
        key: key.to_string(),
        version,
        value: value.clone(),
        kind,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use common::{FixedClock, ParamStyle};
    use serde_json::json;

    use super::*;
    use crate::statements::SqliteDialect;

    fn dialect() -> SqliteDialect {
        SqliteDialect::new(ParamStyle::Colon, Arc::new(FixedClock::new(Utc::now())))
    }

    #[test]
    fn should_read_operations_from_json() {
        // given
        let text = r#"[
            {"operation": "put", "key": "a", "version": 0, "value": {"n": 1}},
            {"operation": "patch", "key": "b", "version": -1, "value": {"n": null}},
            {"operation": "delete_keys", "keys": ["c", "d"]},
            {"operation": "delete_range", "from": "e", "to": "f", "limit": 5}
        ]"#;

        // when
        let ops: Vec<Operation> = serde_json::from_str(text).unwrap();

        // then
        assert_eq!(
            ops,
            vec![
                Operation::put("a", 0, json!({"n": 1})),
                Operation::patch("b", -1, json!({"n": null})),
                Operation::delete_keys(["c", "d"]),
                Operation::delete_range("e", "f", 0, Some(5)),
            ]
        );
    }

    #[test]
    fn should_place_combined_write_after_deletes() {
        // given
        let ops = vec![
            Operation::put("a", -1, json!(1)),
            Operation::delete("x"),
            Operation::patch("b", 2, json!({"k": "v"})),
            Operation::delete_prefix("tmp/", 0, None),
        ];

        // when
        let plan = plan(&dialect(), &ops).unwrap();

        // then
        assert_eq!(plan.mutations.len(), 3);
        assert_eq!(plan.put_patch_index, Some(2));
        assert_eq!(plan.mutations[2].expected_rows, Some(2));
        assert_eq!(plan.mutations[0].expected_rows, None);
        assert_eq!(
            plan.versions,
            BTreeMap::from([("a".to_string(), -1), ("b".to_string(), 2)])
        );
    }

    #[test]
    fn should_reject_duplicate_write_keys() {
        // given
        let ops = vec![
            Operation::put("a", -1, json!(1)),
            Operation::patch("a", -1, json!({})),
        ];

        // when
        let result = plan(&dialect(), &ops);

        // then
        assert!(matches!(result, Err(Error::InvalidInput(msg)) if msg.contains("\"a\"")));
    }

    #[test]
    fn should_reject_empty_prefix_in_batch() {
        let result = plan(&dialect(), &[Operation::delete_prefix("", 0, None)]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn should_map_all_keys_token_to_empty_prefix() {
        assert_eq!(delete_prefix_target("deleteprefix", ALL_KEYS).unwrap(), "");
        assert_eq!(delete_prefix_target("deleteprefix", "p/").unwrap(), "p/");
    }

    #[test]
    fn should_plan_deletes_only_without_row_expectation() {
        // when
        let plan = plan(&dialect(), &[Operation::delete("a")]).unwrap();

        // then
        assert_eq!(plan.put_patch_index, None);
        assert!(plan.versions.is_empty());
    }
}
