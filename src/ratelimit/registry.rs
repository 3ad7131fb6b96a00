use std::{collections::HashMap, sync::Arc};

use crate::{
    config::{BudgetGroupConfig, EngineConfig, EngineKind},
    error::{AdmissionError, AdmissionResult},
    ratelimit::{
        RateLimitEngine, budget::RateLimitBudget, in_memory::MemoryRateLimitEngine,
        redis_backend::RedisRateLimitEngine,
    },
    storage::StorageRegistry,
};

#[derive(Default)]
pub struct RateLimitEngineRegistry {
    engines: HashMap<String, Arc<dyn RateLimitEngine>>,
}

impl RateLimitEngineRegistry {
    pub fn from_config(
        configs: &[EngineConfig],
        storages: &StorageRegistry,
    ) -> AdmissionResult<Self> {
        let mut engines: HashMap<String, Arc<dyn RateLimitEngine>> = HashMap::new();

        for config in configs {
            let engine: Arc<dyn RateLimitEngine> = match config.kind {
                EngineKind::Memory => Arc::new(MemoryRateLimitEngine::new()),
                EngineKind::Redis => {
                    let redis = config.redis.as_ref().ok_or_else(|| {
                        AdmissionError::InvalidConfig(format!(
                            "redis engine {} has no redis section",
                            config.name
                        ))
                    })?;
                    let store = storages.redis(&redis.storage_name)?;
                    Arc::new(RedisRateLimitEngine::new(
                        config.name.clone(),
                        store,
                        redis.timeout,
                    ))
                }
            };

            if engines.insert(config.name.clone(), engine).is_some() {
                return Err(AdmissionError::DuplicateName {
                    kind: "engine",
                    name: config.name.clone(),
                });
            }
            tracing::debug!(engine = %config.name, kind = ?config.kind, "rate limit engine ready");
        }

        Ok(Self { engines })
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RateLimitEngine>> {
        self.engines.get(name).cloned()
    }

    fn resolve(&self, name: &str) -> AdmissionResult<Arc<dyn RateLimitEngine>> {
        self.get(name)
            .ok_or_else(|| AdmissionError::UnknownEngine(name.to_string()))
    }
}

#[derive(Default)]
pub struct RateLimitBudgetRegistry {
    budgets: HashMap<String, Arc<RateLimitBudget>>,
}

impl RateLimitBudgetRegistry {
    pub fn from_config(
        groups: &[BudgetGroupConfig],
        engines: &RateLimitEngineRegistry,
    ) -> AdmissionResult<Self> {
        let mut budgets = HashMap::new();

        for group in groups {
            // Budgets of a group without an explicit default share one fresh memory engine.
            let default_engine = match &group.default_engine {
                Some(name) => engines.resolve(name)?,
                None => Arc::new(MemoryRateLimitEngine::new()) as Arc<dyn RateLimitEngine>,
            };

            for config in &group.budgets {
                let engine = match &config.engine {
                    Some(name) => engines.resolve(name)?,
                    None => default_engine.clone(),
                };

                let budget = RateLimitBudget::from_config(config, engine, group.failure_policy)?;
                if budgets
                    .insert(config.name.clone(), Arc::new(budget))
                    .is_some()
                {
                    return Err(AdmissionError::DuplicateName {
                        kind: "budget",
                        name: config.name.clone(),
                    });
                }
                tracing::debug!(
                    budget = %config.name,
                    rules = config.rules.len(),
                    "rate limit budget ready"
                );
            }
        }

        Ok(Self { budgets })
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimitBudget>> {
        self.budgets.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.budgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.budgets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BudgetConfig, RedisEngineConfig, RuleConfig},
        ratelimit::{FailurePolicy, redis_backend::tests::ScriptedStore},
        storage::Storage,
    };
    use std::time::Duration;

    fn memory_engine(name: &str) -> EngineConfig {
        EngineConfig {
            name: name.to_string(),
            kind: EngineKind::Memory,
            redis: None,
        }
    }

    fn redis_engine(name: &str, storage: &str) -> EngineConfig {
        EngineConfig {
            name: name.to_string(),
            kind: EngineKind::Redis,
            redis: Some(RedisEngineConfig {
                storage_name: storage.to_string(),
                timeout: Duration::from_secs(1),
            }),
        }
    }

    fn budget(name: &str, engine: Option<&str>) -> BudgetConfig {
        BudgetConfig {
            name: name.to_string(),
            engine: engine.map(str::to_string),
            rules: vec![RuleConfig {
                method: Some("eth_call".to_string()),
                pattern: None,
                requests: 1,
                period: Duration::from_secs(60),
            }],
        }
    }

    fn group(default_engine: Option<&str>, budgets: Vec<BudgetConfig>) -> BudgetGroupConfig {
        BudgetGroupConfig {
            default_engine: default_engine.map(str::to_string),
            failure_policy: FailurePolicy::FailClosed,
            budgets,
        }
    }

    #[test]
    fn redis_engine_requires_redis_storage() {
        let storages = StorageRegistry::new();
        let err = RateLimitEngineRegistry::from_config(&[redis_engine("r", "cache")], &storages)
            .err()
            .unwrap();
        assert!(matches!(err, AdmissionError::MissingStorage(_)));

        let mut storages = StorageRegistry::new();
        storages
            .insert("cache", Storage::Redis(Arc::new(ScriptedStore::default())))
            .unwrap();
        let registry =
            RateLimitEngineRegistry::from_config(&[redis_engine("r", "cache")], &storages).unwrap();
        assert_eq!(registry.get("r").unwrap().kind(), "redis");
    }

    #[test]
    fn unknown_engine_reference_fails_fast() {
        let engines = RateLimitEngineRegistry::default();

        let err = RateLimitBudgetRegistry::from_config(&[group(Some("ghost"), vec![])], &engines)
            .err()
            .unwrap();
        assert!(matches!(err, AdmissionError::UnknownEngine(name) if name == "ghost"));

        let err = RateLimitBudgetRegistry::from_config(
            &[group(None, vec![budget("b", Some("ghost"))])],
            &engines,
        )
        .err()
        .unwrap();
        assert!(matches!(err, AdmissionError::UnknownEngine(_)));
    }

    #[tokio::test]
    async fn group_budgets_share_default_engine_unless_overridden() {
        let engines =
            RateLimitEngineRegistry::from_config(&[memory_engine("dedicated")], &StorageRegistry::new())
                .unwrap();
        let registry = RateLimitBudgetRegistry::from_config(
            &[group(
                None,
                vec![budget("a", None), budget("b", None), budget("c", Some("dedicated"))],
            )],
            &engines,
        )
        .unwrap();

        assert_eq!(registry.len(), 3);
        let a = registry.get("a").unwrap();
        let c = registry.get("c").unwrap();
        assert!(a.allow("eth_call").await.unwrap());
        assert!(!a.allow("eth_call").await.unwrap());
        // separate counters: command names embed the budget name
        assert!(registry.get("b").unwrap().allow("eth_call").await.unwrap());
        assert!(c.allow("eth_call").await.unwrap());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_budget_names_are_rejected() {
        let err = RateLimitBudgetRegistry::from_config(
            &[
                group(None, vec![budget("dup", None)]),
                group(None, vec![budget("dup", None)]),
            ],
            &RateLimitEngineRegistry::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, AdmissionError::DuplicateName { kind: "budget", .. }));
    }
}
