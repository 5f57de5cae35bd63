//! Scraping orchestration runtime for live sports-match pages.
//!
//! Tasks enter through a rate-limited priority scheduler, run on a bounded
//! pool of headless browser contexts behind per-adapter circuit breakers,
//! and land in a TTL cache. A health grader watches for stalls and drives
//! pool recycling.

pub mod adapter;
pub mod browser;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod status;
