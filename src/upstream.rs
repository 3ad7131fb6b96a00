use std::{collections::HashMap, sync::Arc};

use tokio::{sync::broadcast, task::JoinHandle};

use crate::{
    autotune::UpstreamAutoTune,
    config::UpstreamConfig,
    error::{AdmissionError, AdmissionResult},
    ratelimit::{Admission, budget::RateLimitBudget, registry::RateLimitBudgetRegistry},
};

/// Admission state for one upstream: an optional static budget and an optional auto-tune loop.
pub struct UpstreamHandle {
    id: String,
    budget: Option<Arc<RateLimitBudget>>,
    auto_tune: Option<Arc<UpstreamAutoTune>>,
}

impl UpstreamHandle {
    pub fn new(
        id: impl Into<String>,
        budget: Option<Arc<RateLimitBudget>>,
        auto_tune: Option<Arc<UpstreamAutoTune>>,
    ) -> Self {
        Self {
            id: id.into(),
            budget,
            auto_tune,
        }
    }

    pub fn auto_tune(&self) -> Option<&Arc<UpstreamAutoTune>> {
        self.auto_tune.as_ref()
    }

    /// Budget first; a budget denial leaves the auto-tune bucket untouched.
    pub async fn admit(&self, method: &str) -> Admission {
        let admission = match &self.budget {
            Some(budget) => budget.decide(method).await,
            None => Admission::Allowed,
        };
        if !admission.is_allowed() {
            return admission;
        }

        match &self.auto_tune {
            Some(auto_tune) if !auto_tune.allow() => {
                tracing::debug!(upstream = %self.id, method, "auto-tune limit reached");
                Admission::Denied
            }
            _ => admission,
        }
    }

    pub fn record_error(&self) {
        if let Some(auto_tune) = &self.auto_tune {
            auto_tune.inc_errors();
        }
    }
}

#[derive(Default)]
pub struct UpstreamRegistry {
    upstreams: HashMap<String, Arc<UpstreamHandle>>,
}

impl UpstreamRegistry {
    pub fn from_config(
        configs: &[UpstreamConfig],
        budgets: &RateLimitBudgetRegistry,
    ) -> AdmissionResult<Self> {
        let mut upstreams = HashMap::new();

        for config in configs {
            let budget = match &config.rate_limit_budget {
                Some(name) => Some(
                    budgets
                        .get(name)
                        .ok_or_else(|| AdmissionError::UnknownBudget(name.clone()))?,
                ),
                None => None,
            };

            let auto_tune = config
                .auto_tune
                .as_ref()
                .filter(|auto_tune| auto_tune.enabled)
                .map(|auto_tune| Arc::new(UpstreamAutoTune::new(config.id.clone(), auto_tune)));

            let handle = UpstreamHandle::new(config.id.clone(), budget, auto_tune);
            if upstreams
                .insert(config.id.clone(), Arc::new(handle))
                .is_some()
            {
                return Err(AdmissionError::DuplicateName {
                    kind: "upstream",
                    name: config.id.clone(),
                });
            }
        }

        Ok(Self { upstreams })
    }

    pub fn get(&self, id: &str) -> Option<Arc<UpstreamHandle>> {
        self.upstreams.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UpstreamHandle>> {
        self.upstreams.values()
    }

    /// Spawns one recalculation loop per auto-tuned upstream; each ends on `shutdown`.
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        self.upstreams
            .values()
            .filter_map(|handle| handle.auto_tune.clone())
            .map(|auto_tune| {
                tracing::info!(
                    upstream = %auto_tune.upstream_id(),
                    rate_limit = auto_tune.rate_limit(),
                    "starting auto-tune loop"
                );
                tokio::spawn(auto_tune.run(shutdown.subscribe()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AutoTuneConfig, BudgetConfig, BudgetGroupConfig, RuleConfig},
        ratelimit::{FailurePolicy, registry::RateLimitEngineRegistry},
    };
    use std::time::Duration;

    fn budgets() -> RateLimitBudgetRegistry {
        RateLimitBudgetRegistry::from_config(
            &[BudgetGroupConfig {
                default_engine: None,
                failure_policy: FailurePolicy::FailClosed,
                budgets: vec![BudgetConfig {
                    name: "public".to_string(),
                    engine: None,
                    rules: vec![RuleConfig {
                        method: Some("eth_getLogs".to_string()),
                        pattern: None,
                        requests: 1,
                        period: Duration::from_secs(60),
                    }],
                }],
            }],
            &RateLimitEngineRegistry::default(),
        )
        .unwrap()
    }

    fn auto_tune(init_rate_limit: u32) -> AutoTuneConfig {
        AutoTuneConfig {
            init_rate_limit,
            period: Duration::from_secs(3600),
            init_rate_limit_period: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[test]
    fn unknown_budget_fails_fast() {
        let err = UpstreamRegistry::from_config(
            &[UpstreamConfig {
                id: "node".to_string(),
                rate_limit_budget: Some("ghost".to_string()),
                auto_tune: None,
            }],
            &budgets(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, AdmissionError::UnknownBudget(_)));
    }

    #[test]
    fn disabled_auto_tune_is_not_built() {
        let registry = UpstreamRegistry::from_config(
            &[UpstreamConfig {
                id: "node".to_string(),
                rate_limit_budget: None,
                auto_tune: Some(AutoTuneConfig {
                    enabled: false,
                    ..auto_tune(10)
                }),
            }],
            &budgets(),
        )
        .unwrap();
        assert!(registry.get("node").unwrap().auto_tune().is_none());
    }

    #[tokio::test]
    async fn budget_denial_does_not_spend_auto_tune_tokens() {
        let registry = UpstreamRegistry::from_config(
            &[UpstreamConfig {
                id: "node".to_string(),
                rate_limit_budget: Some("public".to_string()),
                auto_tune: Some(auto_tune(2)),
            }],
            &budgets(),
        )
        .unwrap();
        let node = registry.get("node").unwrap();

        assert_eq!(node.admit("eth_getLogs").await, Admission::Allowed);
        assert_eq!(node.admit("eth_getLogs").await, Admission::Denied);
        // one auto-tune token left after the budget-denied call
        assert_eq!(node.admit("eth_call").await, Admission::Allowed);
        assert_eq!(node.admit("eth_call").await, Admission::Denied);

        node.record_error();
        let snapshot = node.auto_tune().unwrap().snapshot();
        assert_eq!(snapshot.pending_attempts, 3);
        assert_eq!(snapshot.pending_errors, 1);
    }

    #[tokio::test]
    async fn started_loops_stop_on_shutdown() {
        let registry = UpstreamRegistry::from_config(
            &[
                UpstreamConfig {
                    id: "a".to_string(),
                    rate_limit_budget: None,
                    auto_tune: Some(auto_tune(10)),
                },
                UpstreamConfig {
                    id: "b".to_string(),
                    rate_limit_budget: None,
                    auto_tune: None,
                },
            ],
            &budgets(),
        )
        .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = registry.start(&shutdown_tx);
        assert_eq!(handles.len(), 1);

        shutdown_tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("loop should exit")
                .unwrap();
        }
    }
}
