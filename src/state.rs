use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
/// Errors for this module.
pub enum Error {
    /// The value under the given key could not be converted.
    #[error("cannot convert state value under key {key}")]
    Convert {
        key: String,
        source: serde_json::Error,
    },
}

/// Key-value state backend. Operations on a single key are linearizable;
/// stores are shared between the actors' state and the reminder records.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error>;

    async fn set(&self, key: &str, value: Value) -> Result<(), Error>;

    /// Remove the entry, returning whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, Error>;

    /// All entries whose keys start with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, Error>;
}

/// In-memory store, the backend the demo runs on.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, Error> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, Error> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, Error> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Typed view of one actor instance's private slice of the store. All keys
/// are namespaced with the owning instance's kind and ID.
#[derive(Clone)]
pub struct StateAccessor {
    store: Arc<dyn StateStore>,
    prefix: String,
}

impl StateAccessor {
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned,
    {
        let key = self.full_key(key);
        match self.store.get(&key).await? {
            Some(value) => {
                let value =
                    serde_json::from_value(value).map_err(|source| Error::Convert { key, source })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set<T>(&self, key: &str, value: &T) -> Result<(), Error>
    where
        T: Serialize + Sync,
    {
        let key = self.full_key(key);
        let value = serde_json::to_value(value).map_err(|source| Error::Convert {
            key: key.clone(),
            source,
        })?;
        self.store.set(&key, value).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, Error> {
        Ok(self.store.get(&self.full_key(key)).await?.is_some())
    }

    /// Remove the entry, returning whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, Error> {
        self.store.remove(&self.full_key(key)).await
    }

    pub(crate) fn new(store: Arc<dyn StateStore>, prefix: String) -> Self {
        Self { store, prefix }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}
