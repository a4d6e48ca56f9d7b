//! Keyrate - per-key in-process rate limiting
//!
//! This crate hands out one token-bucket [`Limiter`](ratelimit::Limiter) per
//! identifier (user, route, IP, ...) and keeps them in a fixed-capacity
//! [`LimiterRegistry`](ratelimit::LimiterRegistry) that evicts the
//! least-recently-used limiter once full.

pub mod config;
pub mod error;
pub mod ratelimit;
