//! Registry of per-key limiters.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::limiter::Limiter;
use super::lru::{Insertion, LruCache};
use super::policy::Policy;
use crate::error::{KeyrateError, Result};

/// Number of limiters a registry holds unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 10_240;

const DEFAULT_CAPACITY_NONZERO: NonZeroUsize = match NonZeroUsize::new(DEFAULT_CAPACITY) {
    Some(capacity) => capacity,
    None => panic!("default capacity must be non-zero"),
};

/// A fixed-capacity map from identifier to [`Limiter`].
///
/// Each identifier maps to at most one limiter. Once `capacity` identifiers
/// are held, registering a new one evicts the least recently used. Lookups
/// and registrations both count as use.
///
/// This struct is thread-safe; share it as `Arc<LimiterRegistry>`.
pub struct LimiterRegistry {
    /// Limiters indexed by identifier, in recency order
    cache: Mutex<LruCache<String, Arc<Limiter>>>,
    /// Time source handed to every limiter this registry creates
    clock: Arc<dyn Clock>,
}

impl LimiterRegistry {
    /// Create an empty registry holding at most `capacity` limiters.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    /// Create an empty registry whose limiters read time from `clock`.
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or(KeyrateError::InvalidCapacity)?;
        Ok(Self::build(capacity, clock))
    }

    fn build(capacity: NonZeroUsize, clock: Arc<dyn Clock>) -> Self {
        debug!(capacity = capacity.get(), "Creating limiter registry");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    /// Look up the limiter registered for `key`.
    ///
    /// A hit marks the entry most recently used. A miss returns `None`; this
    /// never creates a limiter.
    pub fn get(&self, key: &str) -> Option<Arc<Limiter>> {
        let limiter = self.cache.lock().get(key).cloned();
        trace!(key = %key, hit = limiter.is_some(), "Limiter lookup");
        limiter
    }

    /// Register a new limiter for `key` with the given rate and burst.
    ///
    /// Fails with [`KeyrateError::InvalidRate`] if `rate` is negative or NaN.
    /// See [`LimiterRegistry::create_with`] for replacement and eviction.
    pub fn create(&self, key: impl Into<String>, rate: f64, burst: u32) -> Result<Arc<Limiter>> {
        let policy = Policy::new(rate, burst)?;
        Ok(self.create_with(key, policy))
    }

    /// Register a new limiter for `key` built from `policy`.
    ///
    /// An existing limiter for `key` is replaced outright; its token state
    /// is not carried over. If the registry is full, the least recently used
    /// limiter is evicted to make room.
    pub fn create_with(&self, key: impl Into<String>, policy: Policy) -> Arc<Limiter> {
        let key = key.into();
        let limiter = Arc::new(self.new_limiter(policy));

        let outcome = self.cache.lock().insert(key.clone(), limiter.clone());
        self.log_insertion(&key, &policy, outcome);

        limiter
    }

    /// Return the limiter for `key`, registering one from `policy` if absent.
    ///
    /// Lookup and registration happen under the same lock, so concurrent
    /// callers seeing `key` for the first time all receive the same limiter.
    /// An existing limiter is returned as is, even if `policy` differs.
    pub fn get_or_create(&self, key: &str, policy: Policy) -> Arc<Limiter> {
        let mut cache = self.cache.lock();
        if let Some(limiter) = cache.get(key) {
            return limiter.clone();
        }

        let limiter = Arc::new(self.new_limiter(policy));
        let outcome = cache.insert(key.to_string(), limiter.clone());
        drop(cache);

        self.log_insertion(key, &policy, outcome);
        limiter
    }

    /// Whether a limiter is registered for `key`. Does not affect recency.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.lock().contains(key)
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether no limiters are registered.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Maximum number of registered limiters.
    pub fn capacity(&self) -> usize {
        self.cache.lock().capacity()
    }

    /// Registered identifiers, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.cache.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    fn new_limiter(&self, policy: Policy) -> Limiter {
        Limiter::with_clock(policy.rate, policy.burst, self.clock.clone())
    }

    fn log_insertion(&self, key: &str, policy: &Policy, outcome: Insertion<String, Arc<Limiter>>) {
        match outcome {
            Insertion::Inserted => debug!(
                key = %key,
                rate = %policy.rate,
                burst = policy.burst,
                "Registered limiter"
            ),
            Insertion::Replaced(_) => debug!(
                key = %key,
                rate = %policy.rate,
                burst = policy.burst,
                "Replaced limiter"
            ),
            Insertion::Evicted(evicted, _) => debug!(
                key = %key,
                evicted = %evicted,
                rate = %policy.rate,
                burst = policy.burst,
                "Registered limiter, evicted least recently used"
            ),
        }
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::build(DEFAULT_CAPACITY_NONZERO, Arc::new(SystemClock))
    }
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("LimiterRegistry")
            .field("len", &cache.len())
            .field("capacity", &cache.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Rate};
    use std::time::Duration;

    fn registry(capacity: usize) -> (LimiterRegistry, ManualClock) {
        let clock = ManualClock::new();
        let registry = LimiterRegistry::with_clock(capacity, Arc::new(clock.clone())).unwrap();
        (registry, clock)
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _clock) = registry(4);
        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 4);
    }

    #[test]
    fn test_default_capacity() {
        let registry = LimiterRegistry::default();
        assert_eq!(registry.capacity(), DEFAULT_CAPACITY);
        assert_eq!(registry.capacity(), 10_240);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            LimiterRegistry::new(0),
            Err(KeyrateError::InvalidCapacity)
        ));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (registry, _clock) = registry(4);
        assert!(registry.get("non-existent").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_returns_registered_instance() {
        let (registry, _clock) = registry(4);
        let created = registry.create("user:123", 10.0, 20).unwrap();

        let found = registry.get("user:123").unwrap();
        assert!(Arc::ptr_eq(&created, &found));

        // Decisions through either handle draw from the same bucket.
        for _ in 0..10 {
            assert!(created.allow());
            assert!(found.allow());
        }
        assert!(!created.allow());
        assert!(!found.allow());
    }

    #[test]
    fn test_create_rejects_invalid_rate() {
        let (registry, _clock) = registry(4);
        assert!(matches!(
            registry.create("user:1", -0.5, 3),
            Err(KeyrateError::InvalidRate(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_create_replaces_existing() {
        let (registry, _clock) = registry(4);
        let first = registry.create("key", 0.0, 1).unwrap();
        assert!(first.allow());
        assert!(!first.allow());

        let second = registry.create("key", 0.0, 1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        // Fresh bucket, prior state is not merged.
        assert!(registry.get("key").unwrap().allow());
        // The replaced handle keeps working on its own bucket.
        assert!(!first.allow());
    }

    #[test]
    fn test_eviction_of_least_recently_used() {
        let (registry, _clock) = registry(3);
        registry.create("a", 1.0, 1).unwrap();
        registry.create("b", 1.0, 1).unwrap();
        registry.create("c", 1.0, 1).unwrap();

        registry.create("d", 1.0, 1).unwrap();

        assert_eq!(registry.len(), 3);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());
        assert!(registry.get("d").is_some());
    }

    #[test]
    fn test_lookup_protects_from_eviction() {
        let (registry, _clock) = registry(3);
        registry.create("a", 1.0, 1).unwrap();
        registry.create("b", 1.0, 1).unwrap();
        registry.create("c", 1.0, 1).unwrap();

        assert!(registry.get("a").is_some());
        registry.create("d", 1.0, 1).unwrap();

        assert!(registry.contains("a"));
        assert!(!registry.contains("b"));
        assert_eq!(registry.keys(), vec!["d", "a", "c"]);
    }

    #[test]
    fn test_contains_does_not_refresh() {
        let (registry, _clock) = registry(2);
        registry.create("a", 1.0, 1).unwrap();
        registry.create("b", 1.0, 1).unwrap();

        assert!(registry.contains("a"));
        registry.create("c", 1.0, 1).unwrap();

        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_evicted_handle_stays_usable() {
        let (registry, _clock) = registry(1);
        let old = registry.create("a", 0.0, 2).unwrap();
        registry.create("b", 0.0, 2).unwrap();

        assert!(registry.get("a").is_none());
        assert!(old.allow());
        assert!(old.allow());
        assert!(!old.allow());
    }

    #[test]
    fn test_get_or_create_reuses_existing() {
        let (registry, _clock) = registry(4);
        let policy = Policy::new(1.0, 1).unwrap();

        let first = registry.get_or_create("k", policy);
        assert!(first.allow());

        let again = registry.get_or_create("k", Policy::new(100.0, 100).unwrap());
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.burst(), 1);
        assert!(!again.allow());
    }

    #[test]
    fn test_limiters_share_registry_clock() {
        let (registry, clock) = registry(4);
        let limiter = registry.create_with("k", Policy {
            rate: Rate::per_second(1.0).unwrap(),
            burst: 1,
        });

        assert!(limiter.allow());
        assert!(!limiter.allow());
        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow());
    }

    #[test]
    fn test_concurrent_get_or_create_yields_single_limiter() {
        let registry = LimiterRegistry::new(16).unwrap();
        let policy = Policy::new(0.0, 100).unwrap();

        let handles: Vec<Arc<Limiter>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_or_create("shared", policy)))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(registry.len(), 1);
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
    }

    #[test]
    fn test_concurrent_registration_respects_capacity() {
        let registry = LimiterRegistry::new(64).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..100 {
                        let key = format!("t{}:{}", t, i);
                        registry.create(key.as_str(), 5.0, 5).unwrap();
                        registry.get(&key);
                    }
                });
            }
        });

        assert_eq!(registry.len(), 64);
        assert_eq!(registry.keys().len(), 64);
    }
}
