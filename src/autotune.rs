//! Feedback controller that resizes an upstream's request rate from observed errors and load.
//!
//! The hot path (`allow`, `inc_errors`) only touches atomics and the current generation's
//! histogram. Every `period` the generation is swapped out wholesale and the limit recomputed:
//!
//! - error rate at or above the threshold shrinks the limit (×0.5 when at least twice the
//!   threshold, ×0.7 otherwise);
//! - an error-free cycle with peak utilization above 95%, or a rate-limited share above the
//!   threshold, grows it by ×1.1;
//! - otherwise nothing changes. The limit never drops below 1.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{config::AutoTuneConfig, ratelimit::token_bucket::TokenBucket};

const HIGH_UTILIZATION: f64 = 0.95;

#[derive(Default)]
struct Generation {
    errors: AtomicU64,
    rate_limited: AtomicU64,
    // sub-period index -> attempts
    attempts: DashMap<u64, AtomicU64>,
}

impl Generation {
    fn record_attempt(&self, time_key: u64) {
        if let Some(counter) = self.attempts.get(&time_key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.attempts
            .entry(time_key)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn attempt_totals(&self) -> (u64, u64) {
        self.attempts.iter().fold((0, 0), |(total, peak), entry| {
            let count = entry.value().load(Ordering::Relaxed);
            (total + count, peak.max(count))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Decrease,
    Increase,
    Unchanged,
}

/// Inputs and outcome of one recalculation cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recalculation {
    pub total_attempts: u64,
    pub peak_requests: u64,
    pub peak_utilization: f64,
    pub allowed: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub error_rate: f64,
    pub rate_limited_rate: f64,
    pub old_limit: u32,
    pub new_limit: u32,
    pub adjustment: Adjustment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTuneSnapshot {
    pub upstream_id: String,
    pub rate_limit: u32,
    pub rate_limit_period_ms: u64,
    pub available_tokens: u32,
    pub pending_attempts: u64,
    pub pending_errors: u64,
    pub pending_rate_limited: u64,
    pub adjustments: u64,
    pub last_adjusted_at: Option<DateTime<Utc>>,
}

pub struct UpstreamAutoTune {
    upstream_id: String,
    period: Duration,
    error_threshold: f64,
    rate_limit_period: Duration,
    origin: Instant,
    rate_limit: AtomicU32,
    bucket: ArcSwap<TokenBucket>,
    generation: ArcSwap<Generation>,
    adjustments: AtomicU64,
    // unix millis, 0 until the first adjustment
    last_adjusted_ms: AtomicI64,
}

impl UpstreamAutoTune {
    pub fn new(upstream_id: impl Into<String>, config: &AutoTuneConfig) -> Self {
        let rate_limit = config.init_rate_limit.max(1);
        Self {
            upstream_id: upstream_id.into(),
            period: config.period,
            error_threshold: config.error_threshold,
            rate_limit_period: config.init_rate_limit_period,
            origin: Instant::now(),
            rate_limit: AtomicU32::new(rate_limit),
            bucket: ArcSwap::from_pointee(TokenBucket::new(
                rate_limit,
                config.init_rate_limit_period,
            )),
            generation: ArcSwap::from_pointee(Generation::default()),
            adjustments: AtomicU64::new(0),
            last_adjusted_ms: AtomicI64::new(0),
        }
    }

    pub fn upstream_id(&self) -> &str {
        &self.upstream_id
    }

    pub fn rate_limit(&self) -> u32 {
        self.rate_limit.load(Ordering::Acquire)
    }

    /// Records the attempt and takes a token. Never blocks.
    pub fn allow(&self) -> bool {
        let generation = self.generation.load();
        generation.record_attempt(self.time_key(Instant::now()));

        if self.bucket.load().try_take() {
            true
        } else {
            generation.rate_limited.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Reports a failure of a request previously admitted by `allow`.
    pub fn inc_errors(&self) {
        self.generation
            .load()
            .errors
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Recalculates every `period` until `shutdown` fires or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.recalculate_rate_limit();
                }
                _ = shutdown.recv() => {
                    tracing::info!(upstream = %self.upstream_id, "auto-tune loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn recalculate_rate_limit(&self) -> Recalculation {
        // Concurrent callers land in the fresh generation from here on.
        let generation = self.generation.swap(Arc::new(Generation::default()));

        let errors = generation.errors.load(Ordering::Relaxed);
        let rate_limited = generation.rate_limited.load(Ordering::Relaxed);
        let (total_attempts, peak_requests) = generation.attempt_totals();

        let old_limit = self.rate_limit();
        let peak_utilization = peak_requests as f64 / f64::from(old_limit);
        let allowed = total_attempts.saturating_sub(rate_limited);
        let error_rate = if allowed == 0 {
            0.0
        } else {
            errors as f64 / allowed as f64
        };
        let rate_limited_rate = if total_attempts == 0 {
            0.0
        } else {
            rate_limited as f64 / total_attempts as f64
        };

        let (adjustment, new_limit) = if allowed > 0 && error_rate >= self.error_threshold {
            let limit = if error_rate >= 2.0 * self.error_threshold {
                scale(old_limit, 1, 2)
            } else {
                scale(old_limit, 7, 10)
            };
            (Adjustment::Decrease, limit)
        } else if errors == 0
            && (peak_utilization > HIGH_UTILIZATION || rate_limited_rate > self.error_threshold)
        {
            (Adjustment::Increase, scale(old_limit, 11, 10))
        } else {
            (Adjustment::Unchanged, old_limit)
        };

        let report = Recalculation {
            total_attempts,
            peak_requests,
            peak_utilization,
            allowed,
            errors,
            rate_limited,
            error_rate,
            rate_limited_rate,
            old_limit,
            new_limit,
            adjustment,
        };

        if new_limit != old_limit {
            self.apply_limit(new_limit);
            tracing::info!(
                upstream = %self.upstream_id,
                old_limit,
                new_limit,
                error_rate,
                peak_utilization,
                rate_limited_rate,
                "auto-tune adjusted rate limit"
            );
        } else {
            tracing::debug!(
                upstream = %self.upstream_id,
                limit = old_limit,
                total_attempts,
                errors,
                "auto-tune kept rate limit"
            );
        }

        report
    }

    pub fn snapshot(&self) -> AutoTuneSnapshot {
        let generation = self.generation.load();
        let last_adjusted_ms = self.last_adjusted_ms.load(Ordering::Relaxed);

        AutoTuneSnapshot {
            upstream_id: self.upstream_id.clone(),
            rate_limit: self.rate_limit(),
            rate_limit_period_ms: self.rate_limit_period.as_millis() as u64,
            available_tokens: self.bucket.load().available(),
            pending_attempts: generation.attempt_totals().0,
            pending_errors: generation.errors.load(Ordering::Relaxed),
            pending_rate_limited: generation.rate_limited.load(Ordering::Relaxed),
            adjustments: self.adjustments.load(Ordering::Relaxed),
            last_adjusted_at: (last_adjusted_ms != 0)
                .then(|| DateTime::from_timestamp_millis(last_adjusted_ms))
                .flatten(),
        }
    }

    fn apply_limit(&self, limit: u32) {
        self.rate_limit.store(limit, Ordering::Release);
        self.bucket
            .store(Arc::new(TokenBucket::new(limit, self.rate_limit_period)));
        self.adjustments.fetch_add(1, Ordering::Relaxed);
        self.last_adjusted_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn time_key(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.rate_limit_period.as_nanos().max(1)) as u64
    }
}

/// `ceil(limit × numerator / denominator)` in integers, floored at 1.
fn scale(limit: u32, numerator: u64, denominator: u64) -> u32 {
    let scaled = (u64::from(limit) * numerator).div_ceil(denominator);
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}
