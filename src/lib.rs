//! Ratequeue - Throughput-Limiting Task Scheduler
//!
//! Deferred tasks are pushed onto named limiters and executed on background
//! worker threads, no more than a configured number per rolling time window.
//! Limiters can be chained so a stricter sub-category of traffic is also
//! bounded by the limit on all traffic.

pub mod config;
pub mod error;
pub mod ratelimit;
