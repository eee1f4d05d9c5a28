use crate::clock::{self, Clock};
use crate::keyed::{KeyedMap, DEFAULT_MAX_KEYS};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Quota algorithm and its parameters, shared by every subject of a limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitPolicy {
    /// Burst up to `capacity`, refilled continuously at `refill_rate` tokens per second.
    TokenBucket { capacity: f64, refill_rate: f64 },
    /// At most `max_requests` admissions in any trailing `window`.
    SlidingWindow { max_requests: u32, window: Duration },
}

impl RateLimitPolicy {
    pub fn token_bucket(capacity: f64, refill_rate: f64) -> Self {
        Self::TokenBucket {
            capacity,
            refill_rate,
        }
    }

    pub fn sliding_window(max_requests: u32, window: Duration) -> Self {
        Self::SlidingWindow {
            max_requests,
            window,
        }
    }

    /// Token bucket refilling at `rps` with one second worth of burst (at least 1).
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        Some(Self::token_bucket(rps.max(1.0), rps))
    }

    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::TokenBucket { .. } => "token_bucket",
            Self::SlidingWindow { .. } => "sliding_window",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::TokenBucket {
                capacity,
                refill_rate,
            } => {
                if !capacity.is_finite() || capacity < 1.0 {
                    return Err(Error::invalid_field(
                        "rate_limit.capacity",
                        format!("capacity must be a finite number >= 1, got {}", capacity),
                    ));
                }
                if !refill_rate.is_finite() || refill_rate <= 0.0 {
                    return Err(Error::invalid_field(
                        "rate_limit.refill_rate",
                        format!("refill_rate must be a finite number > 0, got {}", refill_rate),
                    ));
                }
            }
            Self::SlidingWindow {
                max_requests,
                window,
            } => {
                if max_requests == 0 {
                    return Err(Error::invalid_field(
                        "rate_limit.max_requests",
                        "max_requests must be at least 1",
                    ));
                }
                if window.is_zero() {
                    return Err(Error::invalid_field(
                        "rate_limit.window_ms",
                        "window must be longer than zero",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub policy: RateLimitPolicy,
    /// Upper bound on tracked subjects; least recently seen subjects are forgotten first.
    pub max_keys: usize,
}

impl RateLimiterConfig {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new(RateLimitPolicy::token_bucket(10.0, 10.0))
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Time until at least one unit of quota is available; `None` when admitted.
    pub retry_after: Option<Duration>,
    /// Whole units of quota left after this check.
    pub remaining: u32,
}

impl Decision {
    fn admit(remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after: None,
            remaining,
        }
    }

    fn reject(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
            remaining: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub algorithm: &'static str,
    /// Tokens left (token bucket) or free slots in the window (sliding window).
    pub available: f64,
    pub limit: f64,
    /// Estimated wait until a unit of quota is available, if currently exhausted.
    pub estimated_wait: Option<Duration>,
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_rate: f64, now: Instant) {
        // saturating: a clock observed out of order never drains tokens
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens += elapsed * refill_rate;
            self.last_refill = now;
        }
        self.tokens = self.tokens.clamp(0.0, capacity);
    }

    fn wait(&self, refill_rate: f64) -> Duration {
        secs_to_duration((1.0 - self.tokens) / refill_rate)
    }

    fn try_take(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> Decision {
        self.refill(capacity, refill_rate, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision::admit(self.tokens.floor() as u32)
        } else {
            Decision::reject(self.wait(refill_rate))
        }
    }
}

#[derive(Debug, Default)]
struct SlidingWindow {
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Keeps only admissions inside `(now - window, now]`.
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait(&self, window: Duration, now: Instant) -> Duration {
        self.admitted
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn try_take(&mut self, max_requests: u32, window: Duration, now: Instant) -> Decision {
        self.prune(window, now);
        let used = self.admitted.len() as u32;
        if used < max_requests {
            self.admitted.push_back(now);
            Decision::admit(max_requests - used - 1)
        } else {
            Decision::reject(self.wait(window, now))
        }
    }
}

#[derive(Debug)]
enum Quota {
    Bucket(TokenBucket),
    Window(SlidingWindow),
}

impl Quota {
    fn fresh(policy: &RateLimitPolicy, now: Instant) -> Self {
        match *policy {
            RateLimitPolicy::TokenBucket { capacity, .. } => {
                Quota::Bucket(TokenBucket::full(capacity, now))
            }
            RateLimitPolicy::SlidingWindow { .. } => Quota::Window(SlidingWindow::default()),
        }
    }

    /// Resets the state when the policy switched algorithm since it was created.
    fn align(&mut self, policy: &RateLimitPolicy, now: Instant) {
        let matches = matches!(
            (&*self, policy),
            (Quota::Bucket(_), RateLimitPolicy::TokenBucket { .. })
                | (Quota::Window(_), RateLimitPolicy::SlidingWindow { .. })
        );
        if !matches {
            *self = Quota::fresh(policy, now);
        }
    }

    fn try_take(&mut self, policy: &RateLimitPolicy, now: Instant) -> Decision {
        self.align(policy, now);
        match (self, policy) {
            (
                Quota::Bucket(b),
                &RateLimitPolicy::TokenBucket {
                    capacity,
                    refill_rate,
                },
            ) => b.try_take(capacity, refill_rate, now),
            (
                Quota::Window(w),
                &RateLimitPolicy::SlidingWindow {
                    max_requests,
                    window,
                },
            ) => w.try_take(max_requests, window, now),
            _ => unreachable!("quota aligned to policy above"),
        }
    }

    fn snapshot(&mut self, policy: &RateLimitPolicy, now: Instant) -> RateLimiterSnapshot {
        self.align(policy, now);
        let (available, limit, estimated_wait) = match (&mut *self, policy) {
            (
                Quota::Bucket(b),
                &RateLimitPolicy::TokenBucket {
                    capacity,
                    refill_rate,
                },
            ) => {
                b.refill(capacity, refill_rate, now);
                let wait = (b.tokens < 1.0).then(|| b.wait(refill_rate));
                (b.tokens, capacity, wait)
            }
            (
                Quota::Window(w),
                &RateLimitPolicy::SlidingWindow {
                    max_requests,
                    window,
                },
            ) => {
                w.prune(window, now);
                let used = w.admitted.len() as u32;
                let wait = (used >= max_requests).then(|| w.wait(window, now));
                (
                    f64::from(max_requests.saturating_sub(used)),
                    f64::from(max_requests),
                    wait,
                )
            }
            _ => unreachable!("quota aligned to policy above"),
        };
        RateLimiterSnapshot {
            algorithm: policy.algorithm(),
            available,
            limit,
            estimated_wait,
        }
    }

    /// True when the state is indistinguishable from a fresh one.
    fn is_idle(&mut self, policy: &RateLimitPolicy, now: Instant) -> bool {
        let snap = self.snapshot(policy, now);
        snap.available >= snap.limit
    }
}

/// Per-subject rate limiter.
///
/// - One quota state per subject key, created on first reference
/// - State for a key is guarded by its own lock
/// - Lazy refill/pruning on each check; no background tasks
pub struct RateLimiter {
    policy: ArcSwap<RateLimitPolicy>,
    quotas: KeyedMap<Mutex<Quota>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self::with_clock(cfg, clock::system())
    }

    pub fn with_clock(cfg: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy: ArcSwap::from_pointee(cfg.policy),
            quotas: KeyedMap::new(cfg.max_keys),
            clock,
        }
    }

    pub fn policy(&self) -> Arc<RateLimitPolicy> {
        self.policy.load_full()
    }

    /// Swap the policy for all subjects. Existing states adapt on their next check.
    pub fn reconfigure(&self, policy: RateLimitPolicy) -> Result<()> {
        policy.validate()?;
        tracing::info!(algorithm = policy.algorithm(), "rate limit policy replaced");
        self.policy.store(Arc::new(policy));
        Ok(())
    }

    fn quota(&self, key: &str) -> Arc<Mutex<Quota>> {
        let now = self.clock.now();
        let policy = self.policy.load();
        self.quotas
            .get_or_insert_with(key, || Mutex::new(Quota::fresh(&policy, now)))
    }

    fn lock(quota: &Mutex<Quota>) -> MutexGuard<'_, Quota> {
        // every Quota update completes before the guard drops
        quota.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn decide_locked(&self, key: &str, quota: &mut Quota) -> Decision {
        let policy = self.policy.load();
        let decision = quota.try_take(&policy, self.clock.now());
        if !decision.allowed {
            tracing::debug!(
                key = %key,
                retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
                "rate limit exceeded"
            );
        }
        decision
    }

    /// Admit or reject one request for `key`, consuming one unit of quota when admitted.
    pub fn check_and_consume(&self, key: &str) -> Decision {
        let quota = self.quota(key);
        let mut guard = Self::lock(&quota);
        self.decide_locked(key, &mut guard)
    }

    /// Like [`check_and_consume`](Self::check_and_consume), but a cancelled token wins
    /// over the decision and leaves the subject's quota untouched.
    pub fn check_and_consume_with_cancel(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(quota) = self.quotas.get(key) else {
            // inserting may evict another subject, so the check is committed from here on
            return Ok(self.check_and_consume(key));
        };
        let mut guard = Self::lock(&quota);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.decide_locked(key, &mut guard))
    }

    /// Wait until `key` is admitted, sleeping for the advertised `retry_after` between checks.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            let decision = self.check_and_consume_with_cancel(key, cancel)?;
            if decision.allowed {
                return Ok(());
            }
            let wait = decision
                .retry_after
                .unwrap_or_default()
                .max(Duration::from_millis(1));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Current quota for `key`, or `None` if the key is not tracked.
    pub fn snapshot(&self, key: &str) -> Option<RateLimiterSnapshot> {
        let quota = self.quotas.peek(key)?;
        let policy = self.policy.load();
        let mut guard = Self::lock(&quota);
        Some(guard.snapshot(&policy, self.clock.now()))
    }

    pub fn tracked_keys(&self) -> usize {
        self.quotas.len()
    }

    pub fn forget(&self, key: &str) -> bool {
        self.quotas.remove(key).is_some()
    }

    /// Drop subjects whose quota has fully recovered. Returns how many were dropped.
    ///
    /// Subjects with a check in flight are skipped.
    pub fn purge_idle(&self) -> usize {
        let policy = self.policy.load();
        let now = self.clock.now();
        let purged = self
            .quotas
            .retain(|_, quota| !Self::lock(quota).is_idle(&policy, now));
        if purged > 0 {
            tracing::debug!(purged, "idle rate limit subjects dropped");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn limiter(policy: RateLimitPolicy) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let rl = RateLimiter::with_clock(RateLimiterConfig::new(policy), Arc::new(clock.clone()));
        (rl, clock)
    }

    #[test]
    fn test_policy_from_rps() {
        assert_eq!(
            RateLimitPolicy::from_rps(10.0),
            Some(RateLimitPolicy::token_bucket(10.0, 10.0))
        );
        // burst should be at least 1.0
        assert_eq!(
            RateLimitPolicy::from_rps(0.5),
            Some(RateLimitPolicy::token_bucket(1.0, 0.5))
        );
        assert!(RateLimitPolicy::from_rps(0.0).is_none());
        assert!(RateLimitPolicy::from_rps(-1.0).is_none());
        assert!(RateLimitPolicy::from_rps(f64::NAN).is_none());
        assert!(RateLimitPolicy::from_rps(f64::INFINITY).is_none());
    }

    #[test]
    fn test_policy_validation() {
        assert!(RateLimitPolicy::token_bucket(5.0, 1.0).validate().is_ok());
        assert!(RateLimitPolicy::token_bucket(0.5, 1.0).validate().is_err());
        assert!(RateLimitPolicy::token_bucket(5.0, 0.0).validate().is_err());
        assert!(RateLimitPolicy::sliding_window(0, Duration::from_secs(1))
            .validate()
            .is_err());
        let err = RateLimitPolicy::sliding_window(3, Duration::ZERO)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("rate_limit.window_ms")
        );
    }

    #[test]
    fn test_token_bucket_burst_then_reject() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(5.0, 1.0));
        for i in 0..5 {
            let d = rl.check_and_consume("user-1");
            assert!(d.allowed, "request {} should be admitted", i);
            assert_eq!(d.retry_after, None);
            assert_eq!(d.remaining, 4 - i);
        }
        let d = rl.check_and_consume("user-1");
        assert!(!d.allowed);
        assert_eq!(d.retry_after, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_token_bucket_fractional_refill_accumulates() {
        let (rl, clock) = limiter(RateLimitPolicy::token_bucket(1.0, 2.0));
        assert!(rl.check_and_consume("k").allowed);

        clock.advance(Duration::from_millis(250));
        let d = rl.check_and_consume("k");
        assert!(!d.allowed);
        // 0.5 token banked, 0.5 missing at 2 tokens/s
        assert_eq!(d.retry_after, Some(Duration::from_millis(250)));

        clock.advance(Duration::from_millis(250));
        assert!(rl.check_and_consume("k").allowed);
    }

    #[test]
    fn test_token_bucket_never_exceeds_capacity() {
        let (rl, clock) = limiter(RateLimitPolicy::token_bucket(3.0, 100.0));
        rl.check_and_consume("k");
        clock.advance(Duration::from_secs(3600));
        let snap = rl.snapshot("k").unwrap();
        assert_eq!(snap.available, 3.0);
        assert_eq!(snap.limit, 3.0);
        assert!(snap.estimated_wait.is_none());
    }

    #[test]
    fn test_token_bucket_bounds_hold_over_irregular_checks() {
        let (rl, clock) = limiter(RateLimitPolicy::token_bucket(4.0, 3.0));
        let mut seed: u64 = 0x9e3779b97f4a7c15;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            clock.advance(Duration::from_millis(seed >> 56));
            rl.check_and_consume("k");
            let snap = rl.snapshot("k").unwrap();
            assert!(snap.available >= 0.0 && snap.available <= 4.0);
        }
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill_or_drain() {
        let start = std::time::Instant::now();
        let clock = ManualClock::starting_at(start + Duration::from_secs(10));
        let rl = RateLimiter::with_clock(
            RateLimiterConfig::new(RateLimitPolicy::token_bucket(2.0, 1.0)),
            Arc::new(clock.clone()),
        );
        assert!(rl.check_and_consume("k").allowed);
        clock.set(start);
        assert!(rl.check_and_consume("k").allowed);
        assert!(!rl.check_and_consume("k").allowed);
    }

    #[test]
    fn test_sliding_window_limit_and_retry_after() {
        let (rl, clock) = limiter(RateLimitPolicy::sliding_window(3, Duration::from_secs(10)));
        assert!(rl.check_and_consume("ip").allowed);
        clock.advance(Duration::from_secs(2));
        assert!(rl.check_and_consume("ip").allowed);
        assert!(rl.check_and_consume("ip").allowed);

        let d = rl.check_and_consume("ip");
        assert!(!d.allowed);
        // oldest admission at t=0 leaves the window at t=10, now is t=2
        assert_eq!(d.retry_after, Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_sliding_window_boundary_is_half_open() {
        let (rl, clock) = limiter(RateLimitPolicy::sliding_window(2, Duration::from_secs(1)));
        assert!(rl.check_and_consume("k").allowed);
        assert!(rl.check_and_consume("k").allowed);

        clock.advance(Duration::from_millis(999));
        assert!(!rl.check_and_consume("k").allowed);

        // exactly one window later the t=0 admissions fall out of (now - W, now]
        clock.advance(Duration::from_millis(1));
        assert!(rl.check_and_consume("k").allowed);
        assert!(rl.check_and_consume("k").allowed);
        assert!(!rl.check_and_consume("k").allowed);
    }

    #[test]
    fn test_subjects_are_isolated() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(1.0, 1.0));
        assert!(rl.check_and_consume("alice").allowed);
        assert!(!rl.check_and_consume("alice").allowed);
        assert!(rl.check_and_consume("bob").allowed);
        assert_eq!(rl.tracked_keys(), 2);
    }

    #[test]
    fn test_cancelled_check_leaves_quota_untouched() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(1.0, 1.0));
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            rl.check_and_consume_with_cancel("k", &token),
            Err(Error::Cancelled)
        ));
        assert!(rl.snapshot("k").is_none());
        assert!(rl.check_and_consume("k").allowed);
    }

    #[test]
    fn test_reconfigure_switches_algorithm() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(1.0, 1.0));
        assert!(rl.check_and_consume("k").allowed);
        assert!(!rl.check_and_consume("k").allowed);

        rl.reconfigure(RateLimitPolicy::sliding_window(2, Duration::from_secs(60)))
            .unwrap();
        assert!(rl.check_and_consume("k").allowed);
        assert!(rl.check_and_consume("k").allowed);
        assert!(!rl.check_and_consume("k").allowed);
        assert_eq!(rl.snapshot("k").unwrap().algorithm, "sliding_window");

        assert!(rl
            .reconfigure(RateLimitPolicy::token_bucket(0.0, 1.0))
            .is_err());
    }

    #[test]
    fn test_reconfigure_clamps_to_smaller_capacity() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(10.0, 1.0));
        rl.check_and_consume("k");
        rl.reconfigure(RateLimitPolicy::token_bucket(2.0, 1.0))
            .unwrap();
        assert!(rl.check_and_consume("k").allowed);
        assert!(rl.check_and_consume("k").allowed);
        assert!(!rl.check_and_consume("k").allowed);
    }

    #[test]
    fn test_purge_idle_drops_recovered_subjects() {
        let (rl, clock) = limiter(RateLimitPolicy::token_bucket(2.0, 1.0));
        rl.check_and_consume("a");
        rl.check_and_consume("b");
        rl.check_and_consume("b");
        clock.advance(Duration::from_secs(1));

        // "a" is full again, "b" still has one token missing
        assert_eq!(rl.purge_idle(), 1);
        assert!(rl.snapshot("a").is_none());
        assert!(rl.snapshot("b").is_some());
    }

    #[test]
    fn test_purge_skips_subject_with_check_in_flight() {
        let (rl, _clock) = limiter(RateLimitPolicy::sliding_window(1, Duration::from_secs(60)));

        // a check has looked up the state but not yet locked it
        let in_flight = rl.quota("k");
        assert_eq!(rl.purge_idle(), 0);
        assert!(rl.decide_locked("k", &mut RateLimiter::lock(&in_flight)).allowed);
        drop(in_flight);

        let next = rl.check_and_consume("k");
        assert!(!next.allowed, "one admission per window");
        assert_eq!(next.retry_after, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_cancelled_check_for_new_subject_keeps_others() {
        let clock = ManualClock::new();
        let rl = RateLimiter::with_clock(
            RateLimiterConfig::new(RateLimitPolicy::token_bucket(1.0, 1.0)).with_max_keys(1),
            Arc::new(clock),
        );
        assert!(rl.check_and_consume("a").allowed);

        let token = CancellationToken::new();
        token.cancel();
        assert!(rl.check_and_consume_with_cancel("b", &token).is_err());
        assert!(rl.check_and_consume_with_cancel("a", &token).is_err());
        assert_eq!(rl.tracked_keys(), 1);
        assert!(!rl.check_and_consume("a").allowed);
    }

    #[test]
    fn test_max_keys_bounds_tracked_subjects() {
        let clock = ManualClock::new();
        let rl = RateLimiter::with_clock(
            RateLimiterConfig::new(RateLimitPolicy::token_bucket(1.0, 1.0)).with_max_keys(2),
            Arc::new(clock),
        );
        for key in ["a", "b", "c"] {
            rl.check_and_consume(key);
        }
        assert_eq!(rl.tracked_keys(), 2);
        assert!(rl.snapshot("a").is_none());
    }

    #[test]
    fn test_concurrent_checks_never_overdraw() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(100.0, 1.0));
        let rl = Arc::new(rl);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = Arc::clone(&rl);
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| rl.check_and_consume("shared").allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let rl = RateLimiter::new(RateLimiterConfig::new(RateLimitPolicy::token_bucket(
            1.0, 50.0,
        )));
        let token = CancellationToken::new();
        rl.acquire("k", &token).await.unwrap();

        let start = std::time::Instant::now();
        rl.acquire("k", &token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let (rl, _clock) = limiter(RateLimitPolicy::token_bucket(1.0, 0.001));
        let token = CancellationToken::new();
        rl.acquire("k", &token).await.unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(matches!(rl.acquire("k", &token).await, Err(Error::Cancelled)));
    }
}
