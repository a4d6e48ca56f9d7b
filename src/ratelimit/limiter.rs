//! Token-bucket limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::clock::{Clock, SystemClock};
use crate::error::{KeyrateError, Result};

/// Sustained refill rate in permits per second.
///
/// Always non-negative. [`Rate::INFINITE`] means the bucket is refilled to
/// its burst on every decision.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "RateRepr", into = "RateRepr")]
pub struct Rate(pub(super) f64);

impl Rate {
    /// No refill at all; only the initial burst is ever admitted.
    pub const ZERO: Rate = Rate(0.0);
    /// Unbounded refill.
    pub const INFINITE: Rate = Rate(f64::INFINITY);

    /// Create a rate of `permits` per second.
    pub fn per_second(permits: f64) -> Result<Self> {
        if permits.is_nan() || permits < 0.0 {
            return Err(KeyrateError::InvalidRate(permits));
        }
        Ok(Self(permits))
    }

    /// Create a rate that grants one permit every `interval`.
    ///
    /// A zero interval yields [`Rate::INFINITE`].
    pub fn every(interval: Duration) -> Self {
        if interval.is_zero() {
            return Self::INFINITE;
        }
        Self(1.0 / interval.as_secs_f64())
    }

    /// Permits per second as a float.
    pub fn as_per_second(&self) -> f64 {
        self.0
    }

    /// Whether this rate is unbounded.
    pub fn is_infinite(&self) -> bool {
        self.0.is_infinite()
    }

    /// Whether this rate never refills.
    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

impl TryFrom<f64> for Rate {
    type Error = KeyrateError;

    fn try_from(permits: f64) -> Result<Self> {
        Self::per_second(permits)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf/s")
        } else {
            write!(f, "{}/s", self.0)
        }
    }
}

/// Serialized form of a [`Rate`]: a number, or `inf` / `unlimited`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RateRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<RateRepr> for Rate {
    type Error = KeyrateError;

    fn try_from(repr: RateRepr) -> Result<Self> {
        match repr {
            RateRepr::Number(permits) => Rate::per_second(permits),
            RateRepr::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "inf" | "infinite" | "unlimited" => Ok(Rate::INFINITE),
                other => other
                    .parse::<f64>()
                    .map_err(|_| KeyrateError::Config(format!("Invalid rate '{}'", text)))
                    .and_then(Rate::per_second),
            },
        }
    }
}

impl From<Rate> for RateRepr {
    fn from(rate: Rate) -> Self {
        if rate.is_infinite() {
            RateRepr::Text("inf".to_string())
        } else {
            RateRepr::Number(rate.0)
        }
    }
}

/// Mutable part of the bucket, updated as a unit.
#[derive(Debug)]
struct Bucket {
    /// Fractional token count in `[0, burst]`
    tokens: f64,
    /// When `tokens` was last brought up to date
    last_refill: Instant,
}

/// A token-bucket rate limiter for a single identifier.
///
/// Tokens accumulate at `rate` per second up to `burst`; each admitted permit
/// consumes one. The limiter is thread-safe and is usually shared behind an
/// `Arc` handed out by a [`LimiterRegistry`](super::LimiterRegistry).
pub struct Limiter {
    rate: Rate,
    burst: u32,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
}

impl Limiter {
    /// Create a limiter with a full bucket, driven by the system clock.
    ///
    /// Fails with [`KeyrateError::InvalidRate`] if `rate` is negative or NaN.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        Ok(Self::with_clock(
            Rate::per_second(rate)?,
            burst,
            Arc::new(SystemClock),
        ))
    }

    /// Create a limiter with a full bucket, driven by `clock`.
    pub fn with_clock(rate: Rate, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: now,
            }),
            clock,
        }
    }

    /// The sustained refill rate.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// The bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Tokens that would be available right now.
    pub fn tokens(&self) -> f64 {
        let now = self.clock.now();
        let bucket = self.bucket.lock();
        self.refilled(&bucket, now)
    }

    /// Try to take a single permit.
    ///
    /// Returns `true` if the permit was granted.
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Try to take `n` permits at once.
    ///
    /// Either all `n` are granted or none are; a denied request leaves the
    /// token count untouched.
    pub fn allow_n(&self, n: u32) -> bool {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock();

        let tokens = self.refilled(&bucket, now);
        bucket.tokens = tokens;
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        let wanted = n as f64;
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            true
        } else {
            trace!(
                requested = n,
                available = bucket.tokens,
                rate = %self.rate,
                burst = self.burst,
                "Permit denied"
            );
            false
        }
    }

    /// How long until a single permit would be granted.
    ///
    /// See [`Limiter::time_until_allowed_n`].
    pub fn time_until_allowed(&self) -> Option<Duration> {
        self.time_until_allowed_n(1)
    }

    /// How long until `n` permits would be granted, without consuming any.
    ///
    /// Returns `Some(Duration::ZERO)` if they are available now, and `None`
    /// if they never will be (`n` exceeds the burst, or the rate is zero and
    /// the bucket does not already hold enough). Waits too long to represent
    /// saturate to `Duration::MAX`.
    pub fn time_until_allowed_n(&self, n: u32) -> Option<Duration> {
        if n > self.burst {
            return None;
        }

        let available = self.tokens();
        let deficit = n as f64 - available;
        if deficit <= 0.0 {
            return Some(Duration::ZERO);
        }
        if self.rate.is_zero() {
            return None;
        }

        Some(
            Duration::try_from_secs_f64(deficit / self.rate.as_per_second())
                .unwrap_or(Duration::MAX),
        )
    }

    /// Token count after refilling from `bucket.last_refill` up to `now`.
    fn refilled(&self, bucket: &Bucket, now: Instant) -> f64 {
        let ceiling = self.burst as f64;
        if self.rate.is_infinite() {
            return ceiling;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let added = elapsed.as_secs_f64() * self.rate.as_per_second();
        (bucket.tokens + added).min(ceiling)
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .field("tokens", &self.bucket.lock().tokens)
            .finish()
    }
}
