//! Rate governor gating every outbound API request.
//!
//! Admission requires two things, checked in this order:
//!
//! 1. A permit from a FIFO semaphore sized to the maximum number of concurrent
//!    requests (MCR).
//! 2. A slot in a sliding one-second window holding at most the effective
//!    requests-per-second (RPS) admissions.
//!
//! The window is checked only after the permit is held, so the recorded
//! admission instant is the instant the request is actually issued. Both the
//! semaphore and the window lock are fair, which gives FIFO admission overall.
//!
//! The effective RPS starts at the configured ceiling and is tightened by
//! [`RateGovernor::observe`] whenever the API reports less headroom than the
//! ceiling would consume.
//!
//! # Example
//!
//! ```ignore
//! use tally::rate::{GovernorConfig, RateGovernor};
//!
//! let governor = RateGovernor::new(GovernorConfig::new(5, 10))?;
//! let guard = governor.acquire().await?;
//! let response = transport.send(request).await;
//! guard.release();
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, sleep_until};

/// Default limits for the GitHub REST API.
pub mod defaults {
    /// Concurrent in-flight requests.
    pub const MAX_CONCURRENT_REQUESTS: usize = 5;
    /// Requests admitted per trailing second.
    pub const REQUESTS_PER_SECOND: u32 = 10;
}

/// Length of the sliding admission window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Longest pause honored from a rate-limit reset header.
pub const MAX_RESET_PAUSE: Duration = Duration::from_secs(3600);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GovernorError {
    /// The configuration can never admit a request.
    #[error("Invalid rate governor configuration: {0}")]
    InvalidConfig(String),

    /// The governor was closed while waiting for admission.
    #[error("Rate governor closed")]
    Closed,
}

/// Static limits for a [`RateGovernor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorConfig {
    /// Maximum concurrently outstanding requests (MCR).
    pub max_concurrent: usize,
    /// Ceiling on admissions per trailing window (RPS).
    pub requests_per_second: u32,
}

impl GovernorConfig {
    #[must_use]
    pub fn new(max_concurrent: usize, requests_per_second: u32) -> Self {
        Self {
            max_concurrent,
            requests_per_second,
        }
    }

    fn validate(&self) -> Result<(), GovernorError> {
        if self.max_concurrent == 0 {
            return Err(GovernorError::InvalidConfig(
                "max_concurrent_requests must be positive".to_string(),
            ));
        }
        if self.requests_per_second == 0 {
            return Err(GovernorError::InvalidConfig(
                "requests_per_second must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self::new(
            defaults::MAX_CONCURRENT_REQUESTS,
            defaults::REQUESTS_PER_SECOND,
        )
    }
}

/// Rate limit state reported by the remote API on a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Maximum requests allowed per period.
    pub limit: usize,
    /// Remaining requests in the current period.
    pub remaining: usize,
    /// When the period resets.
    pub reset_at: DateTime<Utc>,
    /// Explicit back-off requested by the server.
    pub retry_after: Option<Duration>,
}

/// Outcome of feeding a [`RateLimitInfo`] into the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAdjustment {
    /// Effective RPS changed from `from` to `to`.
    Rate { from: u32, to: u32 },
    /// Admission is suspended for `pause`.
    Paused { pause: Duration },
}

/// Admission timestamps inside the trailing window.
#[derive(Debug, Default)]
struct AdmissionWindow {
    admitted: VecDeque<Instant>,
}

impl AdmissionWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Instant at which the oldest admission leaves the window.
    fn next_free(&self) -> Option<Instant> {
        self.admitted.front().map(|t| *t + RATE_WINDOW)
    }
}

struct GovernorInner {
    permits: Arc<Semaphore>,
    window: Mutex<AdmissionWindow>,
    config: GovernorConfig,
    effective_rps: AtomicU32,
    paused_until: StdMutex<Option<Instant>>,
}

/// Shared gate for outbound requests. Cheap to clone.
#[derive(Clone)]
pub struct RateGovernor {
    inner: Arc<GovernorInner>,
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("config", &self.inner.config)
            .field("effective_rps", &self.effective_rps())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RateGovernor {
    /// Create a governor, rejecting limits that could never admit a request.
    pub fn new(config: GovernorConfig) -> Result<Self, GovernorError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(GovernorInner {
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                window: Mutex::new(AdmissionWindow::default()),
                config,
                effective_rps: AtomicU32::new(config.requests_per_second),
                paused_until: StdMutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> GovernorConfig {
        self.inner.config
    }

    /// Current admissions-per-second limit after any server-driven tightening.
    #[must_use]
    pub fn effective_rps(&self) -> u32 {
        self.inner.effective_rps.load(Ordering::Acquire)
    }

    /// Number of requests currently holding a permit.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.config.max_concurrent - self.inner.permits.available_permits()
    }

    fn paused_until(&self) -> Option<Instant> {
        *self
            .inner
            .paused_until
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for admission. The returned guard releases the permit on drop.
    ///
    /// Cancel-safe: dropping the future before it resolves gives back anything
    /// acquired so far.
    pub async fn acquire(&self) -> Result<RateGuard, GovernorError> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| GovernorError::Closed)?;

        let mut window = self.inner.window.lock().await;
        loop {
            if self.inner.permits.is_closed() {
                return Err(GovernorError::Closed);
            }

            let now = Instant::now();
            if let Some(until) = self.paused_until()
                && until > now
            {
                sleep_until(until).await;
                continue;
            }

            window.prune(now);
            let limit = self.effective_rps() as usize;
            if window.admitted.len() < limit {
                window.admitted.push_back(now);
                break;
            }

            match window.next_free() {
                Some(at) => sleep_until(at).await,
                None => tokio::task::yield_now().await,
            }
        }

        Ok(RateGuard {
            permit: Some(permit),
        })
    }

    /// Feed rate-limit state reported by the API.
    ///
    /// Tightens the effective RPS to what the remaining budget can sustain
    /// until the reset instant, and relaxes it toward the configured ceiling
    /// when the budget allows. An exhausted budget or an explicit
    /// `retry-after` suspends admission.
    pub fn observe(&self, info: &RateLimitInfo) -> Option<RateAdjustment> {
        let until_reset = (info.reset_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_RESET_PAUSE);

        let pause = match info.retry_after {
            Some(retry_after) => Some(retry_after.min(MAX_RESET_PAUSE)),
            None if info.remaining == 0 && !until_reset.is_zero() => Some(until_reset),
            None => None,
        };

        if let Some(pause) = pause {
            self.pause_for(pause);
            tracing::warn!(
                pause_ms = pause.as_millis() as u64,
                remaining = info.remaining,
                "API rate budget exhausted, pausing admission"
            );
            return Some(RateAdjustment::Paused { pause });
        }

        let ceiling = self.inner.config.requests_per_second;
        let target = sustainable_rps(info.remaining, until_reset, ceiling);
        let from = self.inner.effective_rps.swap(target, Ordering::AcqRel);
        if from == target {
            return None;
        }

        if target < from {
            tracing::info!(
                from,
                to = target,
                remaining = info.remaining,
                limit = info.limit,
                "Tightening request rate"
            );
        } else {
            tracing::debug!(from, to = target, "Relaxing request rate");
        }
        Some(RateAdjustment::Rate { from, to: target })
    }

    /// Suspend admission for `pause`, extending any existing pause.
    pub fn pause_for(&self, pause: Duration) {
        let until = Instant::now() + pause;
        let mut paused = self
            .inner
            .paused_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if paused.is_none_or(|current| current < until) {
            *paused = Some(until);
        }
    }

    /// Honor a server-requested `retry-after` delay, capped like a reset
    /// pause. Returns the pause applied.
    pub fn hold_for(&self, retry_after: Duration) -> Duration {
        let pause = retry_after.min(MAX_RESET_PAUSE);
        self.pause_for(pause);
        pause
    }

    /// Stop admitting requests. Pending and future `acquire` calls fail with
    /// [`GovernorError::Closed`]; already granted guards stay valid.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

/// Highest rate that spends `remaining` requests no faster than evenly over
/// `until_reset`, clamped to `1..=ceiling`.
#[must_use]
pub fn sustainable_rps(remaining: usize, until_reset: Duration, ceiling: u32) -> u32 {
    if until_reset.is_zero() {
        return ceiling;
    }
    let per_second = remaining as f64 / until_reset.as_secs_f64();
    let rps = per_second.floor().clamp(1.0, f64::from(ceiling));
    rps as u32
}

/// Proof of admission. Dropping it releases the concurrency permit.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the request slot"]
pub struct RateGuard {
    permit: Option<OwnedSemaphorePermit>,
}

impl RateGuard {
    /// Release the permit now. Consumes the guard, so it cannot happen twice.
    pub fn release(mut self) {
        self.permit.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;

    fn governor(mcr: usize, rps: u32) -> RateGovernor {
        RateGovernor::new(GovernorConfig::new(mcr, rps)).expect("valid config")
    }

    /// Maximum number of instants inside any half-open window of `RATE_WINDOW`.
    fn max_in_any_window(instants: &[Instant]) -> usize {
        let mut sorted = instants.to_vec();
        sorted.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..sorted.len() {
            while sorted[end].duration_since(sorted[start]) >= RATE_WINDOW {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(matches!(
            RateGovernor::new(GovernorConfig::new(0, 5)),
            Err(GovernorError::InvalidConfig(_))
        ));
        assert!(matches!(
            RateGovernor::new(GovernorConfig::new(5, 0)),
            Err(GovernorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_config_matches_github_defaults() {
        let config = GovernorConfig::default();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.requests_per_second, 10);
    }

    #[test]
    fn sustainable_rps_clamps_to_bounds() {
        assert_eq!(sustainable_rps(100, Duration::ZERO, 10), 10);
        assert_eq!(sustainable_rps(5000, Duration::from_secs(10), 10), 10);
        assert_eq!(sustainable_rps(30, Duration::from_secs(10), 10), 3);
        assert_eq!(sustainable_rps(1, Duration::from_secs(100), 10), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_release_returns_permit() {
        let governor = governor(1, 100);
        let guard = governor.acquire().await.unwrap();
        assert_eq!(governor.in_flight(), 1);
        guard.release();
        assert_eq!(governor.in_flight(), 0);

        let guard = governor.acquire().await.unwrap();
        drop(guard);
        assert_eq!(governor.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_delays_admissions_beyond_rps() {
        let governor = governor(10, 2);
        let start = Instant::now();
        for _ in 0..4 {
            governor.acquire().await.unwrap().release();
        }
        // Two admitted at t=0, the next two at t=1s.
        assert_eq!(start.elapsed(), RATE_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_is_fifo() {
        let governor = governor(1, 1000);
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first = governor.acquire().await.unwrap();
        let mut handles = Vec::new();
        for i in 0..5 {
            let governor = governor.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let guard = governor.acquire().await.unwrap();
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
                guard.release();
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::task::yield_now().await;
        }
        first.release();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_waiters() {
        let governor = governor(1, 10);
        let held = governor.acquire().await.unwrap();

        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move { governor.acquire().await })
        };
        tokio::task::yield_now().await;
        governor.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), GovernorError::Closed);
        held.release();
    }

    #[tokio::test(start_paused = true)]
    async fn observe_tightens_and_relaxes() {
        let governor = governor(5, 10);
        let tight = RateLimitInfo {
            limit: 5000,
            remaining: 30,
            reset_at: Utc::now() + chrono::Duration::seconds(10),
            retry_after: None,
        };
        let adjustment = governor.observe(&tight);
        assert!(matches!(
            adjustment,
            Some(RateAdjustment::Rate { from: 10, to }) if to <= 3
        ));
        assert!(governor.effective_rps() <= 3);

        let relaxed = RateLimitInfo {
            limit: 5000,
            remaining: 4999,
            reset_at: Utc::now() + chrono::Duration::seconds(10),
            retry_after: None,
        };
        governor.observe(&relaxed);
        assert_eq!(governor.effective_rps(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn observe_retry_after_pauses_admission() {
        let governor = governor(5, 10);
        let info = RateLimitInfo {
            limit: 5000,
            remaining: 10,
            reset_at: Utc::now(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            governor.observe(&info),
            Some(RateAdjustment::Paused {
                pause: Duration::from_secs(3)
            })
        );

        let start = Instant::now();
        governor.acquire().await.unwrap().release();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn mcr_two_rps_five_over_ten_tasks() {
        let governor = governor(2, 5);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let governor = governor.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            let admitted = Arc::clone(&admitted);
            handles.push(tokio::spawn(async move {
                let guard = governor.acquire().await.unwrap();
                admitted.lock().unwrap().push(Instant::now());
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                guard.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let admitted = admitted.lock().unwrap();
        assert_eq!(admitted.len(), 10);
        assert!(max_in_any_window(&admitted) <= 5);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_exceeds_mcr_or_rps(
            mcr in 1usize..6,
            rps in 1u32..12,
            holds in proptest::collection::vec(0u64..400, 1..40),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let (peak, admitted) = runtime.block_on(async move {
                let governor = governor(mcr, rps);
                let current = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let admitted = Arc::new(StdMutex::new(Vec::new()));

                let mut handles = Vec::new();
                for hold in holds {
                    let governor = governor.clone();
                    let current = Arc::clone(&current);
                    let peak = Arc::clone(&peak);
                    let admitted = Arc::clone(&admitted);
                    handles.push(tokio::spawn(async move {
                        let guard = governor.acquire().await.unwrap();
                        admitted.lock().unwrap().push(Instant::now());
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(hold)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        guard.release();
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
                let admitted = admitted.lock().unwrap().clone();
                (peak.load(Ordering::SeqCst), admitted)
            });

            prop_assert!(peak <= mcr);
            prop_assert!(max_in_any_window(&admitted) <= rps as usize);
        }
    }
}
