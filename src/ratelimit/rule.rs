use regex::Regex;

use crate::{
    config::RuleConfig,
    error::{AdmissionError, AdmissionResult},
    ratelimit::LimiterType,
};

#[derive(Debug, Clone)]
pub enum MethodMatcher {
    Literal(String),
    /// Unanchored search against the method name.
    Pattern(Regex),
}

impl MethodMatcher {
    pub fn matches(&self, method: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == method,
            Self::Pattern(pattern) => pattern.is_match(method),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Literal(literal) => literal,
            Self::Pattern(pattern) => pattern.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub matcher: MethodMatcher,
    pub limiter: LimiterType,
}

impl Rule {
    pub fn from_config(budget: &str, index: usize, config: &RuleConfig) -> AdmissionResult<Self> {
        config.validate(budget, index)?;

        let matcher = match (&config.method, &config.pattern) {
            (Some(method), None) => MethodMatcher::Literal(method.clone()),
            (None, Some(pattern)) => MethodMatcher::Pattern(Regex::new(pattern)?),
            _ => {
                return Err(AdmissionError::InvalidRule {
                    budget: budget.to_string(),
                    index,
                    reason: "exactly one of method or pattern is required".to_string(),
                });
            }
        };

        Ok(Self {
            matcher,
            limiter: LimiterType::FixedWindow {
                requests: config.requests,
                period: config.period,
            },
        })
    }
}
