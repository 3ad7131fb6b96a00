pub mod budget;
pub mod in_memory;
pub mod redis_backend;
pub mod registry;
pub mod rule;
pub mod token_bucket;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;

use crate::error::AdmissionResult;

/// How a single named counter enforces its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterType {
    /// `requests` admissions per `period`. Token bucket in memory, fixed-interval counter in Redis.
    FixedWindow { requests: u32, period: Duration },
}

/// One engine-agnostic unit of enforcement work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitCommand {
    pub name: String,
    pub limiter: LimiterType,
}

/// What to do when the enforcement backend cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    FailOpen,
    #[default]
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
    /// Backend failed and the budget is configured to fail open.
    FailedOpen,
    /// Backend failed and the budget is configured to fail closed.
    Unavailable,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed | Self::FailedOpen)
    }
}

#[async_trait]
pub trait RateLimitEngine: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Advances every command's counter and returns the AND of their outcomes.
    async fn execute(
        &self,
        commands: &[RateLimitCommand],
        deadline: Option<Instant>,
    ) -> AdmissionResult<bool>;
}
