use std::sync::Arc;

use tokio::time::Instant;

use crate::{
    config::BudgetConfig,
    error::AdmissionResult,
    ratelimit::{Admission, FailurePolicy, RateLimitCommand, RateLimitEngine, rule::Rule},
};

/// A named, ordered rule list bound to one engine.
pub struct RateLimitBudget {
    name: String,
    rules: Vec<Rule>,
    engine: Arc<dyn RateLimitEngine>,
    failure_policy: FailurePolicy,
}

impl RateLimitBudget {
    pub fn new(
        name: impl Into<String>,
        rules: Vec<Rule>,
        engine: Arc<dyn RateLimitEngine>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            rules,
            engine,
            failure_policy,
        }
    }

    pub fn from_config(
        config: &BudgetConfig,
        engine: Arc<dyn RateLimitEngine>,
        failure_policy: FailurePolicy,
    ) -> AdmissionResult<Self> {
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| Rule::from_config(&config.name, index, rule))
            .collect::<AdmissionResult<Vec<_>>>()?;

        Ok(Self::new(config.name.clone(), rules, engine, failure_policy))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One command per matching rule. The rule index in the name keeps every rule's
    /// counter independent even when two rules describe the same method.
    pub fn commands_for(&self, method: &str) -> Vec<RateLimitCommand> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.matcher.matches(method))
            .map(|(index, rule)| RateLimitCommand {
                name: format!("{}-{}-{}", self.name, index, rule.matcher.name()),
                limiter: rule.limiter,
            })
            .collect()
    }

    pub async fn allow(&self, method: &str) -> AdmissionResult<bool> {
        self.allow_with_deadline(method, None).await
    }

    /// Unmatched methods are always allowed and never reach the engine.
    pub async fn allow_with_deadline(
        &self,
        method: &str,
        deadline: Option<Instant>,
    ) -> AdmissionResult<bool> {
        let commands = self.commands_for(method);
        if commands.is_empty() {
            return Ok(true);
        }
        self.engine.execute(&commands, deadline).await
    }

    /// `allow` with the budget's failure policy applied to backend errors.
    pub async fn decide(&self, method: &str) -> Admission {
        match self.allow(method).await {
            Ok(true) => Admission::Allowed,
            Ok(false) => Admission::Denied,
            Err(err) => match self.failure_policy {
                FailurePolicy::FailOpen if err.is_backend() => {
                    tracing::warn!(
                        budget = %self.name,
                        method,
                        error = %err,
                        "rate limit backend failed; allowing request because fail-open is enabled"
                    );
                    Admission::FailedOpen
                }
                _ => {
                    tracing::warn!(
                        budget = %self.name,
                        method,
                        error = %err,
                        "rate limit backend failed; rejecting request"
                    );
                    Admission::Unavailable
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::AdmissionError,
        ratelimit::{LimiterType, in_memory::MemoryRateLimitEngine, rule::MethodMatcher},
    };
    use async_trait::async_trait;
    use regex::Regex;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn literal(method: &str, requests: u32, period: Duration) -> Rule {
        Rule {
            matcher: MethodMatcher::Literal(method.to_string()),
            limiter: LimiterType::FixedWindow { requests, period },
        }
    }

    fn pattern(source: &str, requests: u32, period: Duration) -> Rule {
        Rule {
            matcher: MethodMatcher::Pattern(Regex::new(source).unwrap()),
            limiter: LimiterType::FixedWindow { requests, period },
        }
    }

    fn memory_budget(rules: Vec<Rule>) -> RateLimitBudget {
        RateLimitBudget::new(
            "test",
            rules,
            Arc::new(MemoryRateLimitEngine::new()),
            FailurePolicy::FailClosed,
        )
    }

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RateLimitEngine for CountingEngine {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn execute(
            &self,
            _commands: &[RateLimitCommand],
            _deadline: Option<Instant>,
        ) -> AdmissionResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AdmissionError::Backend("down".to_string()))
            } else {
                Ok(true)
            }
        }
    }

    #[test]
    fn command_names_are_deterministic() {
        let budget = memory_budget(vec![
            pattern("eth_.*", 3, Duration::from_secs(1)),
            literal("eth_call", 5, Duration::from_secs(1)),
            literal("net_version", 1, Duration::from_secs(1)),
        ]);

        let names: Vec<_> = budget
            .commands_for("eth_call")
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["test-0-eth_.*", "test-1-eth_call"]);
    }

    #[tokio::test]
    async fn literal_rule_allows_n_then_denies() {
        let budget = memory_budget(vec![literal("eth_blockNumber", 2, Duration::from_secs(1))]);

        assert!(budget.allow("eth_blockNumber").await.unwrap());
        assert!(budget.allow("eth_blockNumber").await.unwrap());
        assert!(!budget.allow("eth_blockNumber").await.unwrap());
    }

    #[tokio::test]
    async fn pattern_rule_shares_one_counter() {
        let budget = memory_budget(vec![pattern("eth_.*", 3, Duration::from_secs(10))]);

        assert!(budget.allow("eth_blockNumber").await.unwrap());
        assert!(budget.allow("eth_getBalance").await.unwrap());
        assert!(budget.allow("eth_call").await.unwrap());
        assert!(!budget.allow("eth_sendTransaction").await.unwrap());
        for _ in 0..5 {
            assert!(budget.allow("net_version").await.unwrap());
        }
    }

    #[tokio::test]
    async fn stricter_overlapping_rule_wins() {
        let budget = memory_budget(vec![
            literal("eth_call", 5, Duration::from_secs(10)),
            pattern("eth_.*", 2, Duration::from_secs(10)),
        ]);

        assert!(budget.allow("eth_call").await.unwrap());
        assert!(budget.allow("eth_call").await.unwrap());
        assert!(!budget.allow("eth_call").await.unwrap());
    }

    #[tokio::test]
    async fn window_resets_after_period() {
        let budget = memory_budget(vec![literal("eth_chainId", 1, Duration::from_millis(50))]);

        assert!(budget.allow("eth_chainId").await.unwrap());
        assert!(!budget.allow("eth_chainId").await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(budget.allow("eth_chainId").await.unwrap());
    }

    #[tokio::test]
    async fn empty_budget_allows_without_touching_engine() {
        let engine = Arc::new(CountingEngine::default());
        let budget = RateLimitBudget::new("empty", vec![], engine.clone(), FailurePolicy::FailClosed);

        for _ in 0..3 {
            assert!(budget.allow("eth_call").await.unwrap());
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_policy_resolves_backend_errors() {
        let engine = Arc::new(CountingEngine {
            fail: true,
            ..Default::default()
        });
        let rules = || vec![literal("eth_call", 1, Duration::from_secs(1))];

        let open = RateLimitBudget::new("open", rules(), engine.clone(), FailurePolicy::FailOpen);
        let closed = RateLimitBudget::new("closed", rules(), engine, FailurePolicy::FailClosed);

        assert!(open.allow("eth_call").await.is_err());
        let admission = open.decide("eth_call").await;
        assert_eq!(admission, Admission::FailedOpen);
        assert!(admission.is_allowed());
        assert_eq!(closed.decide("eth_call").await, Admission::Unavailable);
        assert!(!closed.decide("eth_call").await.is_allowed());
    }
}
