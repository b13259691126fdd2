//! Circuit Breaker Registry (C4, spec.md §4.3): one breaker per
//! `configuration_id`, a sliding-window failure/slow-call counter, and the
//! CLOSED/OPEN/HALF_OPEN state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerParams {
    pub window_size: usize,
    pub minimum_calls: usize,
    pub failure_rate_threshold: f64,
    pub slow_call_duration: Duration,
    pub slow_call_rate_threshold: f64,
    pub open_wait: Duration,
    pub half_open_permitted_calls: usize,
}

impl Default for BreakerParams {
    fn default() -> Self {
        Self {
            window_size: 10,
            minimum_calls: 10,
            failure_rate_threshold: 0.5,
            slow_call_duration: Duration::from_millis(10_000),
            slow_call_rate_threshold: 0.5,
            open_wait: Duration::from_millis(45_000),
            half_open_permitted_calls: 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CallOutcome {
    failed: bool,
    slow: bool,
}

struct Breaker {
    params: BreakerParams,
    state: BreakerState,
    window: VecDeque<CallOutcome>,
    opened_at: Option<Instant>,
    half_open_in_flight: usize,
}

impl Breaker {
    fn new(params: BreakerParams) -> Self {
        Self { params, state: BreakerState::Closed, window: VecDeque::new(), opened_at: None, half_open_in_flight: 0 }
    }

    /// Returns true if a call may proceed; advances OPEN -> HALF_OPEN when
    /// `open_wait` has elapsed.
    fn try_acquire(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.opened_at.map(|at| at.elapsed() >= self.params.open_wait).unwrap_or(false) {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_in_flight = 0;
                    self.try_acquire_half_open()
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => self.try_acquire_half_open(),
        }
    }

    fn try_acquire_half_open(&mut self) -> bool {
        if self.half_open_in_flight < self.params.half_open_permitted_calls {
            self.half_open_in_flight += 1;
            true
        } else {
            false
        }
    }

    fn record(&mut self, failed: bool, duration: Duration) {
        let slow = duration >= self.params.slow_call_duration;

        match self.state {
            BreakerState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                if failed {
                    self.open();
                } else {
                    self.close();
                }
            }
            BreakerState::Closed => {
                self.window.push_back(CallOutcome { failed, slow });
                while self.window.len() > self.params.window_size {
                    self.window.pop_front();
                }
                if self.window.len() >= self.params.minimum_calls {
                    let n = self.window.len() as f64;
                    let failure_rate = self.window.iter().filter(|c| c.failed).count() as f64 / n;
                    let slow_rate = self.window.iter().filter(|c| c.slow).count() as f64 / n;
                    if failure_rate >= self.params.failure_rate_threshold || slow_rate >= self.params.slow_call_rate_threshold {
                        self.open();
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.window.clear();
        self.opened_at = None;
        self.half_open_in_flight = 0;
    }
}

/// A guard returned by [`CircuitBreakerRegistry::acquire`]; records the
/// outcome on drop-free explicit call to keep the record point precise to
/// the attempt's actual duration.
pub struct BreakerPermit {
    breaker: Arc<Mutex<Breaker>>,
}

impl BreakerPermit {
    pub fn record(self, failed: bool, duration: Duration) {
        self.breaker.lock().record(failed, duration);
    }
}

/// Per-configuration breaker registry. Created on first use; entries are
/// never removed (configuration count is bounded by the admin surface).
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<Uuid, Arc<Mutex<Breaker>>>>,
    params: BreakerParams,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: Mutex::new(HashMap::new()), params: BreakerParams::default() }
    }

    pub fn with_params(params: BreakerParams) -> Self {
        Self { breakers: Mutex::new(HashMap::new()), params }
    }

    fn breaker_for(&self, configuration_id: Uuid) -> Arc<Mutex<Breaker>> {
        let mut breakers = self.breakers.lock();
        breakers.entry(configuration_id).or_insert_with(|| Arc::new(Mutex::new(Breaker::new(self.params)))).clone()
    }

    /// Attempt to acquire permission to call through the breaker for
    /// `configuration_id`. `None` means the breaker rejected the call
    /// (OPEN, or HALF_OPEN with no permits left) — the caller must treat
    /// this as `circuit_open` (spec.md §4.3).
    pub fn acquire(&self, configuration_id: Uuid) -> Option<BreakerPermit> {
        let breaker = self.breaker_for(configuration_id);
        let acquired = breaker.lock().try_acquire();
        if acquired {
            Some(BreakerPermit { breaker })
        } else {
            None
        }
    }

    pub fn state(&self, configuration_id: Uuid) -> BreakerState {
        self.breaker_for(configuration_id).lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(minimum_calls: usize, failure_rate_threshold: f64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::with_params(BreakerParams {
            window_size: minimum_calls,
            minimum_calls,
            failure_rate_threshold,
            open_wait: Duration::from_millis(50),
            ..BreakerParams::default()
        })
    }

    #[test]
    fn stays_closed_under_threshold() {
        let reg = registry_with(10, 0.5);
        let id = Uuid::new_v4();
        for _ in 0..4 {
            reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        }
        assert_eq!(reg.state(id), BreakerState::Closed);
    }

    #[test]
    fn opens_after_minimum_calls_with_failure_rate_exceeded() {
        let reg = registry_with(10, 0.5);
        let id = Uuid::new_v4();
        for _ in 0..6 {
            reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        }
        for _ in 0..4 {
            reg.acquire(id).unwrap().record(false, Duration::from_millis(1));
        }
        assert_eq!(reg.state(id), BreakerState::Open);
        assert!(reg.acquire(id).is_none());
    }

    #[tokio::test]
    async fn transitions_half_open_after_wait_then_closes_on_success() {
        let reg = registry_with(10, 0.5);
        let id = Uuid::new_v4();
        for _ in 0..10 {
            reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        }
        assert_eq!(reg.state(id), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let permit = reg.acquire(id).expect("half-open should allow one call");
        permit.record(false, Duration::from_millis(1));
        assert_eq!(reg.state(id), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let reg = registry_with(10, 0.5);
        let id = Uuid::new_v4();
        for _ in 0..10 {
            reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let permit = reg.acquire(id).unwrap();
        permit.record(true, Duration::from_millis(1));
        assert_eq!(reg.state(id), BreakerState::Open);
    }

    #[test]
    fn half_open_rejects_calls_beyond_permitted_count() {
        let reg = CircuitBreakerRegistry::with_params(BreakerParams {
            window_size: 2,
            minimum_calls: 2,
            failure_rate_threshold: 0.5,
            open_wait: Duration::from_millis(0),
            half_open_permitted_calls: 1,
            ..BreakerParams::default()
        });
        let id = Uuid::new_v4();
        reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        reg.acquire(id).unwrap().record(true, Duration::from_millis(1));
        assert_eq!(reg.state(id), BreakerState::Open);

        let first = reg.acquire(id);
        assert!(first.is_some());
        let second = reg.acquire(id);
        assert!(second.is_none());
    }

    #[test]
    fn slow_calls_open_the_breaker() {
        let reg = CircuitBreakerRegistry::with_params(BreakerParams {
            window_size: 10,
            minimum_calls: 10,
            failure_rate_threshold: 0.99,
            slow_call_duration: Duration::from_millis(5),
            slow_call_rate_threshold: 0.5,
            open_wait: Duration::from_millis(50),
            half_open_permitted_calls: 1,
        });
        let id = Uuid::new_v4();
        for _ in 0..10 {
            reg.acquire(id).unwrap().record(false, Duration::from_millis(10));
        }
        assert_eq!(reg.state(id), BreakerState::Open);
    }

    #[test]
    fn distinct_configurations_have_independent_breakers() {
        let reg = registry_with(10, 0.5);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        for _ in 0..10 {
            reg.acquire(a).unwrap().record(true, Duration::from_millis(1));
        }
        assert_eq!(reg.state(a), BreakerState::Open);
        assert_eq!(reg.state(b), BreakerState::Closed);
    }
}
