//! Application orchestration engine: routes job postings to platform form
//! strategies and runs campaigns of attempts under session pooling, rate
//! limiting, circuit breaking and bounded retries.

pub mod answers;
pub mod anthropic;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod pool;
pub mod provider;
pub mod recorder;
pub mod retry;
pub mod router;
pub mod state_machine;
pub mod strategy;
pub mod ui;

#[cfg(test)]
mod testing;
