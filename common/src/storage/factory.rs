//! Backend factory for creating SQL engines from configuration.

use std::sync::Arc;

use super::config::StorageConfig;
use super::postgres::PostgresBackend;
use super::rqlite::RqliteBackend;
use super::sqlite::SqliteBackend;
use super::{SqlBackend, StorageResult};

/// Creates a backend for the given configuration with default options.
///
/// For more control, use [`BackendBuilder`].
pub fn create_backend(config: &StorageConfig) -> StorageResult<Arc<dyn SqlBackend>> {
    BackendBuilder::new(config.clone()).build()
}

/// Builder for backends that need runtime options which cannot be expressed
/// in a configuration file.
///
/// # Example
///
/// ```rust,ignore
/// let http_client = reqwest::Client::builder()
///     .add_root_certificate(cert)
///     .build()?;
/// let backend = BackendBuilder::new(config)
///     .with_http_client(http_client)
///     .build()?;
/// ```
pub struct BackendBuilder {
    config: StorageConfig,
    http_client: Option<reqwest::Client>,
}

impl BackendBuilder {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            http_client: None,
        }
    }

    /// Sets the HTTP client used to reach rqlite. Ignored by other backends.
    ///
    /// The client's own timeout applies in place of the configured one.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> StorageResult<Arc<dyn SqlBackend>> {
        let backend: Arc<dyn SqlBackend> = match &self.config {
            StorageConfig::InMemory => Arc::new(SqliteBackend::in_memory()?),
            StorageConfig::Sqlite(sqlite) => Arc::new(SqliteBackend::open(sqlite)?),
            StorageConfig::Rqlite(rqlite) => match self.http_client {
                Some(client) => Arc::new(RqliteBackend::with_client(rqlite, client)),
                None => Arc::new(RqliteBackend::new(rqlite)?),
            },
            StorageConfig::Postgres(postgres) => Arc::new(PostgresBackend::new(postgres)?),
        };
        tracing::debug!(kind = backend.kind(), "created storage backend");
        Ok(backend)
    }
}
