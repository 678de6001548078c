//! Records and version tokens.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use common::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version token that skips the version check (blind upsert).
pub const ANY_VERSION: i64 = -1;

/// Version token that only succeeds when the key does not exist yet.
pub const NEW_KEY: i64 = 0;

/// Prefix that matches every key in prefix deletes.
///
/// An empty prefix is rejected there so that a missing value cannot wipe
/// the whole store.
pub const ALL_KEYS: &str = "*";

pub(crate) fn check_version(op: &str, key: &str, version: i64) -> Result<()> {
    if version < ANY_VERSION {
        return Err(Error::InvalidInput(format!(
            "{}: invalid version {} for key {:?}, expected -1, 0 or a positive version",
            op, version, key
        )));
    }
    Ok(())
}

/// Formats a creation timestamp the way it is stored.
pub(crate) fn format_created(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_created(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| Error::Encoding(format!("invalid created timestamp {:?}: {}", text, e)))
}

/// A stored record with its value still encoded as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub version: i64,
    /// JSON text of the value.
    pub value: Bytes,
    pub created: DateTime<Utc>,
}

impl Record {
    /// Decodes a `key, version, value, created` row.
    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        if row.len() != 4 {
            return Err(Error::Internal(format!(
                "record: expected 4 columns, got {}",
                row.len()
            )));
        }
        let internal = |field: &str, e: common::StorageError| {
            Error::Internal(format!("record: {}: {}", field, e))
        };
        let key = row.text_at(0).map_err(|e| internal("key", e))?;
        let version = row.i64_at(1).map_err(|e| internal("version", e))?;
        let value = row
            .opt_text_at(2)
            .map_err(|e| internal("value", e))?
            .unwrap_or("null");
        let created = row.text_at(3).map_err(|e| internal("created", e))?;
        Ok(Self {
            key: key.to_string(),
            version,
            value: Bytes::copy_from_slice(value.as_bytes()),
            created: parse_created(created)?,
        })
    }

    /// Decodes the value into `T`.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            Error::Encoding(format!("record {:?}: value: {}", self.key, e))
        })
    }

    /// Decodes the value into `T`, keeping the record metadata.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<RecordOf<T>> {
        Ok(RecordOf {
            key: self.key.clone(),
            version: self.version,
            value: self.value_as()?,
            created: self.created,
        })
    }
}

/// A record whose value has been decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOf<T> {
    pub key: String,
    pub version: i64,
    pub value: T,
    pub created: DateTime<Utc>,
}

/// Decodes the values of `records` into `T`.
///
/// Use `serde_json::Value` when the shape is not known.
pub fn values_of<T: DeserializeOwned>(records: &[Record]) -> Result<Vec<T>> {
    records.iter().map(Record::value_as).collect()
}

/// Decodes `records` into [`RecordOf<T>`].
pub fn records_of<T: DeserializeOwned>(records: &[Record]) -> Result<Vec<RecordOf<T>>> {
    records.iter().map(Record::decode).collect()
}

/// One entry of [`KvStore::put_all`](crate::KvStore::put_all).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutInput {
    pub key: String,
    pub version: i64,
    pub value: serde_json::Value,
}

impl PutInput {
    pub fn new(key: impl Into<String>, version: i64, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            version,
            value,
        }
    }
}
