//! String key/value persistence for indexer caches.
//!
//! The indexer only needs `get` and `set`; whether the records live in process
//! memory or in PostgreSQL is a deployment choice made in the binary.

use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait};
use tokio::sync::RwLock;

use crate::entities::cache_entry;
use crate::entities::prelude::*;

pub const MAX_KEY_LEN: usize = 128;

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replaces the whole record stored under `key`.
    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        check_key(key)?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

pub struct DatabaseCacheStore {
    database: DatabaseConnection,
}

impl DatabaseCacheStore {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }
}

#[async_trait]
impl CacheStore for DatabaseCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let record = CacheEntry::find_by_id(key.to_string())
            .one(&self.database)
            .await
            .with_context(|| format!("Failed to query cache entry {key}"))?;
        Ok(record.map(|model| model.value))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        check_key(key)?;
        let model = cache_entry::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value),
            updated_at: Set(Utc::now().fixed_offset()),
        };
        cache_entry::Entity::insert(model)
            .on_conflict(
                OnConflict::column(cache_entry::Column::Key)
                    .update_columns([cache_entry::Column::Value, cache_entry::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec(&self.database)
            .await
            .with_context(|| format!("Failed to upsert cache entry {key}"))?;
        Ok(())
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(anyhow!("Cache key cannot be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(anyhow!("Cache key exceeds {MAX_KEY_LEN} byte limit"));
    }
    Ok(())
}
