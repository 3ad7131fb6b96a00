use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::{
    error::{AdmissionError, AdmissionResult},
    ratelimit::{LimiterType, RateLimitCommand, RateLimitEngine},
};

/// Counter primitive the Redis engine needs from its storage.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// `INCR` then `PEXPIRE` every key in one round trip, returning post-increment counts in order.
    async fn incr_with_expiry(&self, keys: &[(String, Duration)]) -> AdmissionResult<Vec<i64>>;
}

#[async_trait]
impl CounterStore for ConnectionManager {
    async fn incr_with_expiry(&self, keys: &[(String, Duration)]) -> AdmissionResult<Vec<i64>> {
        let mut conn = self.clone();
        let mut pipe = redis::pipe();
        for (key, ttl) in keys {
            // INCR and PEXPIRE are not atomic as a pair; a key can outlive a crash without a TTL.
            pipe.incr(key, 1)
                .pexpire(key, ttl.as_millis().max(1) as i64)
                .ignore();
        }

        let counts: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(counts)
    }
}

/// Distributed fixed-window counters under `ratelimit:<engine>:<command>`.
///
/// The TTL is re-armed on every hit, so a key under steady traffic only expires once traffic
/// pauses for a full period. Across a window edge up to twice `requests` may pass.
pub struct RedisRateLimitEngine {
    name: String,
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl RedisRateLimitEngine {
    pub fn new(name: impl Into<String>, store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            store,
            timeout,
        }
    }

    fn key(&self, command: &RateLimitCommand) -> String {
        format!("ratelimit:{}:{}", self.name, command.name)
    }
}

#[async_trait]
impl RateLimitEngine for RedisRateLimitEngine {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn execute(
        &self,
        commands: &[RateLimitCommand],
        deadline: Option<Instant>,
    ) -> AdmissionResult<bool> {
        if commands.is_empty() {
            return Ok(true);
        }

        let batch: Vec<(String, Duration)> = commands
            .iter()
            .map(|command| match command.limiter {
                LimiterType::FixedWindow { period, .. } => (self.key(command), period),
            })
            .collect();

        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.timeout);
        let counts = tokio::time::timeout_at(deadline, self.store.incr_with_expiry(&batch))
            .await
            .map_err(|_| AdmissionError::BackendTimeout)??;

        if counts.len() != commands.len() {
            return Err(AdmissionError::Backend(format!(
                "expected {} counters from pipeline, got {}",
                commands.len(),
                counts.len()
            )));
        }

        let mut allowed = true;
        for (command, count) in commands.iter().zip(counts) {
            let over = match command.limiter {
                LimiterType::FixedWindow { requests, .. } => count > i64::from(requests),
            };
            if over {
                tracing::debug!(engine = %self.name, command = %command.name, count, "counter over limit");
                allowed = false;
            }
        }
        Ok(allowed)
    }
}
