use crate::clock::{self, Clock};
use crate::keyed::{KeyedMap, DEFAULT_MAX_KEYS};
use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failure threshold reached, calls fail fast
    Open,
    /// Reset timeout elapsed, a single trial call probes recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid_field(
                "circuit_breaker.failure_threshold",
                "failure_threshold must be at least 1",
            ));
        }
        if self.reset_timeout.is_zero() {
            return Err(Error::invalid_field(
                "circuit_breaker.reset_timeout_ms",
                "reset_timeout must be longer than zero",
            ));
        }
        Ok(())
    }
}

/// The breaker refused the call without attempting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{name}' is open")]
pub struct CircuitOpenError {
    pub name: String,
    /// Time until the breaker lets a trial call through; `None` while a trial is in flight.
    pub retry_after: Option<Duration>,
}

/// Failure of a call made through [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),
    #[error("operation cancelled")]
    Cancelled,
    /// The operation ran and failed; its error is passed through untouched.
    #[error("{0}")]
    Failed(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CallError::Open(_))
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            CallError::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CallError<Error>> for Error {
    fn from(err: CallError<Error>) -> Self {
        match err {
            CallError::Open(e) => Error::CircuitOpen(e),
            CallError::Cancelled => Error::Cancelled,
            CallError::Failed(e) => e,
        }
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every transition; verdicts from older permits are ignored.
    generation: u64,
}

/// Three-state circuit breaker.
///
/// - Counts consecutive failures while closed
/// - Opens at the threshold and fails fast until the reset timeout elapses
/// - Half-open admits exactly one trial call at a time
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::named("default", cfg)
    }

    pub fn named(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, cfg, clock::system())
    }

    pub fn with_clock(
        name: impl Into<String>,
        cfg: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            cfg,
            clock,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // transitions are applied field by field under the guard and cannot panic midway
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies the time-driven Open -> HalfOpen transition.
    fn refresh(&self, st: &mut State, now: Instant) {
        if st.state != CircuitState::Open {
            return;
        }
        let elapsed = st
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.cfg.reset_timeout);
        if elapsed >= self.cfg.reset_timeout {
            st.state = CircuitState::HalfOpen;
            st.trial_in_flight = false;
            st.generation += 1;
            tracing::debug!(breaker = %self.name, "circuit half-open, awaiting trial call");
        }
    }

    fn trip(&self, st: &mut State, now: Instant) {
        st.state = CircuitState::Open;
        st.opened_at = Some(now);
        st.trial_in_flight = false;
        st.generation += 1;
        tracing::warn!(
            breaker = %self.name,
            consecutive_failures = st.consecutive_failures,
            reset_timeout_ms = self.cfg.reset_timeout.as_millis() as u64,
            "circuit opened"
        );
    }

    fn close(&self, st: &mut State) {
        st.state = CircuitState::Closed;
        st.consecutive_failures = 0;
        st.opened_at = None;
        st.trial_in_flight = false;
        st.generation += 1;
        tracing::info!(breaker = %self.name, "circuit closed");
    }

    fn open_error(&self, st: &State, now: Instant) -> CircuitOpenError {
        let retry_after = match st.state {
            CircuitState::Open => st.opened_at.map(|at| {
                (at + self.cfg.reset_timeout).saturating_duration_since(now)
            }),
            _ => None,
        };
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }

    /// Ask for permission to make one call.
    ///
    /// The returned permit must be resolved with [`Permit::success`] or
    /// [`Permit::failure`]. Dropping it unresolved counts as the call never having
    /// happened.
    pub fn try_acquire(&self) -> std::result::Result<Permit<'_>, CircuitOpenError> {
        let now = self.clock.now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        match st.state {
            CircuitState::Closed => Ok(Permit::new(self, st.generation, false)),
            CircuitState::HalfOpen if !st.trial_in_flight => {
                st.trial_in_flight = true;
                Ok(Permit::new(self, st.generation, true))
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                tracing::debug!(breaker = %self.name, state = %st.state, "call rejected");
                Err(self.open_error(&st, now))
            }
        }
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => self.close(&mut st),
            _ => {}
        }
    }

    fn on_failure(&self, generation: u64, trial: bool) {
        let now = self.clock.now();
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures >= self.cfg.failure_threshold {
                    self.trip(&mut st, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                self.trip(&mut st, now);
            }
            _ => {}
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut st = self.lock();
        if st.generation == generation && st.state == CircuitState::HalfOpen {
            st.trial_in_flight = false;
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Fails with [`CallError::Open`] without running `op` when the breaker
    /// refuses the call; otherwise the operation's own error is returned as
    /// [`CallError::Failed`] after being recorded.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        permit.resolve(op().await)
    }

    /// [`execute`](Self::execute) that gives up as soon as `cancel` fires.
    ///
    /// A cancelled call records nothing and frees the half-open trial slot.
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        let permit = self.try_acquire()?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            res = op() => permit.resolve(res),
        }
    }

    /// Blocking counterpart of [`execute`](Self::execute).
    pub fn call<T, E>(
        &self,
        op: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, CallError<E>> {
        let permit = self.try_acquire()?;
        permit.resolve(op())
    }

    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        st.state
    }

    /// Force the breaker closed and forget past failures.
    pub fn reset(&self) {
        let mut st = self.lock();
        self.close(&mut st);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = self.clock.now();
        let mut st = self.lock();
        self.refresh(&mut st, now);
        let open_remaining_ms = match st.state {
            CircuitState::Open => st.opened_at.map(|at| {
                (at + self.cfg.reset_timeout)
                    .saturating_duration_since(now)
                    .as_millis() as u64
            }),
            _ => None,
        };
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            reset_timeout_ms: self.cfg.reset_timeout.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            open_remaining_ms,
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
#[must_use = "an unresolved permit records nothing"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.generation, self.trial);
    }

    fn resolve<T, E>(self, res: std::result::Result<T, E>) -> std::result::Result<T, CallError<E>> {
        match res {
            Ok(v) => {
                self.success();
                Ok(v)
            }
            Err(e) => {
                self.failure();
                Err(CallError::Failed(e))
            }
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

/// One breaker per protected operation key, created on first use.
///
/// Bounded to `max_keys` breakers; an evicted key starts over closed.
pub struct CircuitBreakerRegistry {
    cfg: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: KeyedMap<CircuitBreaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(cfg, DEFAULT_MAX_KEYS, clock::system())
    }

    pub fn with_clock(cfg: CircuitBreakerConfig, max_keys: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            breakers: KeyedMap::new(max_keys),
        }
    }

    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(key, || {
            CircuitBreaker::with_clock(key, self.cfg.clone(), Arc::clone(&self.clock))
        })
    }

    pub async fn execute<F, Fut, T, E>(
        &self,
        key: &str,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.get(key).execute(op).await
    }

    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        key: &str,
        cancel: &CancellationToken,
        op: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.get(key).execute_with_cancel(cancel, op).await
    }

    /// Snapshots of all tracked breakers, most recently used first.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers
            .entries()
            .into_iter()
            .map(|(_, b)| b.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.breakers.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn breaker(threshold: u32, reset: Duration) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_reset_timeout(reset);
        (
            CircuitBreaker::with_clock("upstream", cfg, Arc::new(clock.clone())),
            clock,
        )
    }

    fn fail(cb: &CircuitBreaker) {
        cb.try_acquire().expect("call should be permitted").failure();
    }

    fn succeed(cb: &CircuitBreaker) {
        cb.try_acquire().expect("call should be permitted").success();
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_circuit_breaker_config_validation() {
        assert!(CircuitBreakerConfig::new()
            .with_failure_threshold(0)
            .validate()
            .is_err());
        assert!(CircuitBreakerConfig::new()
            .with_reset_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let (cb, _clock) = breaker(5, Duration::from_secs(30));
        assert_eq!(cb.state(), CircuitState::Closed);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.open_remaining_ms.is_none());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let (cb, _clock) = breaker(3, Duration::from_secs(30));
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 2);

        succeed(&cb);
        assert_eq!(cb.snapshot().consecutive_failures, 0);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_opens_at_threshold() {
        let (cb, _clock) = breaker(3, Duration::from_secs(10));
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        let err = cb.try_acquire().err().unwrap();
        assert_eq!(err.name, "upstream");
        assert_eq!(err.retry_after, Some(Duration::from_secs(10)));
        assert_eq!(cb.snapshot().open_remaining_ms, Some(10_000));
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let (cb, clock) = breaker(3, Duration::from_secs(10));
        for _ in 0..3 {
            fail(&cb);
        }
        clock.advance(Duration::from_secs(5));
        assert!(cb.try_acquire().is_err());

        clock.advance(Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());

        // concurrent callers are turned away while the trial is outstanding
        let err = cb.try_acquire().err().unwrap();
        assert_eq!(err.retry_after, None);

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timeout() {
        let (cb, clock) = breaker(1, Duration::from_secs(10));
        fail(&cb);
        clock.advance(Duration::from_secs(10));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(9));
        assert!(cb.try_acquire().is_err());
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_dropped_trial_permit_frees_slot() {
        let (cb, clock) = breaker(1, Duration::from_secs(1));
        fail(&cb);
        clock.advance(Duration::from_secs(1));

        let trial = cb.try_acquire().unwrap();
        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_stale_verdicts_are_ignored() {
        let (cb, _clock) = breaker(2, Duration::from_secs(30));
        let slow = cb.try_acquire().unwrap();
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // a success from a call started before the trip does not close the circuit
        slow.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_forces_closed() {
        let (cb, _clock) = breaker(1, Duration::from_secs(30));
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_call_propagates_operation_error() {
        let (cb, _clock) = breaker(2, Duration::from_secs(30));
        let res: std::result::Result<(), CallError<&str>> = cb.call(|| Err("boom"));
        assert_eq!(res.unwrap_err().into_failure(), Some("boom"));

        let res: std::result::Result<(), CallError<&str>> = cb.call(|| Err("boom"));
        assert!(!res.unwrap_err().is_open());

        let mut ran = false;
        let res: std::result::Result<(), CallError<&str>> = cb.call(|| {
            ran = true;
            Ok(())
        });
        assert!(res.unwrap_err().is_open());
        assert!(!ran);
    }

    #[test]
    fn test_circuit_breaker_snapshot() {
        let (cb, _clock) = breaker(5, Duration::from_secs(30));
        fail(&cb);
        fail(&cb);

        let snapshot = cb.snapshot();
        assert_eq!(snapshot.name, "upstream");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_threshold, 5);
        assert_eq!(snapshot.reset_timeout_ms, 30_000);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert!(snapshot.open_remaining_ms.is_none());
    }

    #[test]
    fn test_circuit_breaker_thread_safe() {
        let (cb, _clock) = breaker(100, Duration::from_secs(30));
        let cb = Arc::new(cb);

        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    fail(&cb_clone);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.snapshot().consecutive_failures, 50);
    }

    #[test]
    fn test_circuit_breaker_saturating_failures() {
        let (cb, _clock) = breaker(u32::MAX, Duration::from_secs(30));
        for _ in 0..1000 {
            fail(&cb);
        }
        assert_eq!(cb.snapshot().consecutive_failures, 1000);
    }

    #[test]
    fn test_registry_isolates_operations() {
        let clock = ManualClock::new();
        let registry = CircuitBreakerRegistry::with_clock(
            CircuitBreakerConfig::new().with_failure_threshold(1),
            16,
            Arc::new(clock),
        );
        fail(&registry.get("payments"));
        assert_eq!(registry.get("payments").state(), CircuitState::Open);
        assert_eq!(registry.get("search").state(), CircuitState::Closed);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("payments").name(), "payments");
    }

    #[test]
    fn test_call_error_flattens_into_crate_error() {
        let open: Error = CallError::<Error>::Open(CircuitOpenError {
            name: "x".into(),
            retry_after: None,
        })
        .into();
        assert!(matches!(open, Error::CircuitOpen(_)));

        let failed: Error = CallError::Failed(Error::NotFound { key: "k".into() }).into();
        assert!(matches!(failed, Error::NotFound { .. }));
    }
}
