use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use crate::errors::OAuthError;

/// The three values that survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Token,
    RefreshToken,
    LocalSecret,
}

impl StoreKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKey::Token => "TOKEN",
            StoreKey::RefreshToken => "REFRESH_TOKEN",
            StoreKey::LocalSecret => "LOCAL_SECRET",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable string key-value storage for the OAuth session.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, OAuthError>;
    async fn set(&self, key: StoreKey, value: &str) -> Result<(), OAuthError>;
}

/// Token store backed by a single sqlite table.
#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

impl SqliteTokenStore {
    /// Opens (and creates if needed) the sqlite file at `path`.
    #[tracing::instrument(err)]
    pub async fn open(path: &Path) -> Result<Self, OAuthError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the table if it does not exist yet.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, OAuthError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_store (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, OAuthError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM token_store WHERE key = ?")
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    async fn set(&self, key: StoreKey, value: &str) -> Result<(), OAuthError> {
        sqlx::query(
            r#"
            INSERT INTO token_store (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Non-durable store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: RwLock<HashMap<StoreKey, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: StoreKey) -> Result<Option<String>, OAuthError> {
        Ok(self.values.read().await.get(&key).cloned())
    }

    async fn set(&self, key: StoreKey, value: &str) -> Result<(), OAuthError> {
        self.values.write().await.insert(key, value.to_string());
        Ok(())
    }
}
