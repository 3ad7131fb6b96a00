use std::{collections::HashMap, sync::Arc};

use crate::{
    config::{StorageConfig, StorageKind},
    error::{AdmissionError, AdmissionResult},
    ratelimit::redis_backend::CounterStore,
};

/// Named storage handles shared by the gateway's subsystems.
pub enum Storage {
    Redis(Arc<dyn CounterStore>),
    /// Held for other collaborators; admission control never opens it.
    Postgres { connection_url: String },
}

impl Storage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Default)]
pub struct StorageRegistry {
    storages: HashMap<String, Storage>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(configs: &[StorageConfig]) -> AdmissionResult<Self> {
        let mut registry = Self::new();

        for config in configs {
            let storage = match config.kind {
                StorageKind::Redis => {
                    let redis_config = config.redis.as_ref().ok_or_else(|| {
                        AdmissionError::InvalidConfig(format!(
                            "redis storage {} has no redis section",
                            config.name
                        ))
                    })?;
                    let client = redis::Client::open(redis_config.url.as_str())?;
                    let manager = client.get_connection_manager().await?;
                    tracing::info!(storage = %config.name, "connected redis storage");
                    Storage::Redis(Arc::new(manager))
                }
                StorageKind::Postgres => {
                    let postgres = config.postgres.as_ref().ok_or_else(|| {
                        AdmissionError::InvalidConfig(format!(
                            "postgres storage {} has no postgres section",
                            config.name
                        ))
                    })?;
                    Storage::Postgres {
                        connection_url: postgres.connection_url.clone(),
                    }
                }
            };
            registry.insert(config.name.clone(), storage)?;
        }

        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, storage: Storage) -> AdmissionResult<()> {
        let name = name.into();
        if self.storages.contains_key(&name) {
            return Err(AdmissionError::DuplicateName {
                kind: "storage",
                name,
            });
        }
        self.storages.insert(name, storage);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Storage> {
        self.storages.get(name)
    }

    pub fn redis(&self, name: &str) -> AdmissionResult<Arc<dyn CounterStore>> {
        match self.storages.get(name) {
            Some(Storage::Redis(store)) => Ok(store.clone()),
            Some(other) => Err(AdmissionError::WrongStorageKind {
                name: name.to_string(),
                expected: "redis",
                found: other.kind(),
            }),
            None => Err(AdmissionError::MissingStorage(name.to_string())),
        }
    }
}
