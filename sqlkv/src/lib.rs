//! sqlkv - a versioned key-value store over SQL engines.
//!
//! sqlkv gives callers a document-store style API (get, put, merge-patch and
//! delete by key, prefix and range scans, counts and atomic batches) on top
//! of a single `kv` table in SQLite, an rqlite cluster or PostgreSQL. The engine does all
//! storage, indexing and durability; this crate owns the optimistic
//! concurrency protocol.
//!
//! # Key Concepts
//!
//! - **KvStore**: the main entry point, see its docs for the version tokens.
//! - **Record**: a stored value with its key, version and creation time.
//! - **Operation**: one step of an atomic batch run by
//!   [`KvStore::mutate_all`].
//! - **Dialect**: turns logical operations into SQL for one engine family.
//!
//! # Example
//!
//! ```ignore
//! use sqlkv::{ANY_VERSION, ALL_KEYS, Config, KvStore, Operation};
//! use serde_json::json;
//!
//! let store = KvStore::open(Config::default()).await?;
//! store.init().await?;
//!
//! store.put("users/1", ANY_VERSION, &json!({"name": "alice"})).await?;
//! let users = store.get_prefix("users/", 0, None).await?;
//!
//! store
//!     .mutate_all(&[
//!         Operation::patch("users/1", users[0].version, json!({"admin": true})),
//!         Operation::delete("users/2"),
//!     ])
//!     .await?;
//!
//! store.delete_prefix(ALL_KEYS, 0, None).await?;
//! ```

mod batch;
mod config;
mod error;
mod model;
mod statements;
mod store;

pub use batch::Operation;
pub use config::Config;
pub use error::{Error, Result, VersionMismatch};
pub use model::{
    ALL_KEYS, ANY_VERSION, NEW_KEY, PutInput, Record, RecordOf, records_of, values_of,
};
pub use statements::{Dialect, PostgresDialect, PutPatch, SqliteDialect, WriteKind, dialect_for};
pub use store::KvStore;
