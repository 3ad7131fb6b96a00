use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::{
    error::AdmissionResult,
    ratelimit::{LimiterType, RateLimitCommand, RateLimitEngine, token_bucket::TokenBucket},
};

/// In-process engine: one token bucket per command name, created on first use and never evicted.
#[derive(Default)]
pub struct MemoryRateLimitEngine {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl MemoryRateLimitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_for(&self, command: &RateLimitCommand) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(&command.name) {
            return bucket.clone();
        }

        // Racing creators converge on whichever bucket lands first.
        self.buckets
            .entry(command.name.clone())
            .or_insert_with(|| {
                Arc::new(match command.limiter {
                    LimiterType::FixedWindow { requests, period } => {
                        TokenBucket::new(requests, period)
                    }
                })
            })
            .clone()
    }
}

#[async_trait]
impl RateLimitEngine for MemoryRateLimitEngine {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn execute(
        &self,
        commands: &[RateLimitCommand],
        _deadline: Option<Instant>,
    ) -> AdmissionResult<bool> {
        let mut allowed = true;
        // No short-circuit: every matched counter is charged.
        for command in commands {
            if !self.bucket_for(command).try_take() {
                allowed = false;
            }
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn command(name: &str, requests: u32, period: Duration) -> RateLimitCommand {
        RateLimitCommand {
            name: name.to_string(),
            limiter: LimiterType::FixedWindow { requests, period },
        }
    }

    #[tokio::test]
    async fn denies_after_quota_is_spent() {
        let engine = MemoryRateLimitEngine::new();
        let batch = [command("a", 2, Duration::from_secs(1))];

        assert!(engine.execute(&batch, None).await.unwrap());
        assert!(engine.execute(&batch, None).await.unwrap());
        assert!(!engine.execute(&batch, None).await.unwrap());
    }

    #[tokio::test]
    async fn failing_command_does_not_stop_later_ones_from_being_charged() {
        let engine = MemoryRateLimitEngine::new();
        let strict = command("strict", 1, Duration::from_secs(60));
        let loose = command("loose", 3, Duration::from_secs(60));
        let batch = [strict.clone(), loose.clone()];

        assert!(engine.execute(&batch, None).await.unwrap());
        assert!(!engine.execute(&batch, None).await.unwrap());
        // loose has been charged twice already
        assert!(engine.execute(&[loose.clone()], None).await.unwrap());
        assert!(!engine.execute(&[loose], None).await.unwrap());
    }

    #[tokio::test]
    async fn refills_after_period() {
        let engine = MemoryRateLimitEngine::new();
        let batch = [command("a", 1, Duration::from_millis(50))];

        assert!(engine.execute(&batch, None).await.unwrap());
        assert!(!engine.execute(&batch, None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(engine.execute(&batch, None).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_bucket() {
        let engine = Arc::new(MemoryRateLimitEngine::new());
        let batch = Arc::new([command("shared", 10, Duration::from_secs(3600))]);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                let batch = batch.clone();
                tokio::spawn(async move { engine.execute(&batch[..], None).await.unwrap() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(engine.bucket_count(), 1);
    }
}
