pub mod api;
pub mod autotune;
pub mod config;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod storage;
pub mod upstream;
