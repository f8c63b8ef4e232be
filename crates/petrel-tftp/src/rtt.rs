//! Adaptive round-trip-time estimation.
//!
//! Each session times the gap between sending a packet and receiving its
//! reply, keeps a running average, and budgets three average round trips for
//! the next reply before retransmitting. The estimator is deliberately a
//! bounded additive average rather than Jacobson/Karels: samples are clamped
//! to 0.01-3.0 s, the average never exceeds 2.0 s, and the derived TTL stays
//! within 0.5-5.0 s.

use std::time::{Duration, Instant};

use thiserror::Error;

/// `within_ttl` is only meaningful while the estimator is timing a packet.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("round-trip timer is not running")]
pub struct NotRunning;

const MIN_SAMPLE: f64 = 0.01;
const MAX_SAMPLE: f64 = 3.0;
const MAX_AVG: f64 = 2.0;
const MIN_TTL: f64 = 0.5;
const MAX_TTL: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    rtt_count: u32,
    rtt_sum: f64,
    rtt_avg: f64,
    ttl: f64,
    started_at: Option<Instant>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            rtt_count: 1,
            rtt_sum: 0.5,
            rtt_avg: 0.5,
            ttl: 1.5,
            started_at: None,
        }
    }

    /// Start timing an outbound packet that expects a reply.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.started_at = Some(now);
    }

    /// Record the reply for the packet being timed and update the average
    /// and TTL. A no-op when the estimator is not running.
    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    pub fn stop_at(&mut self, now: Instant) {
        let Some(started) = self.started_at.take() else {
            return;
        };
        let mut sample = now.saturating_duration_since(started).as_secs_f64();
        if sample == 0.0 {
            // A clock that only ticks in whole seconds can report zero;
            // assume half a second rather than polluting the average.
            sample = 0.5;
        }
        sample = sample.clamp(MIN_SAMPLE, MAX_SAMPLE);
        self.rtt_sum += sample;
        self.rtt_count += 1;
        self.rtt_avg = self.rtt_sum / f64::from(self.rtt_count);
        // Bounded history: after twenty samples collapse the sum so old
        // measurements decay instead of accumulating forever.
        if self.rtt_count > 20 {
            self.rtt_sum = 5.0 * self.rtt_avg;
            self.rtt_count = 5;
        }
        if self.rtt_avg > MAX_AVG {
            self.rtt_sum = 10.0;
            self.rtt_count = 5;
            self.rtt_avg = MAX_AVG;
        }
        self.ttl = (3.0 * self.rtt_avg).clamp(MIN_TTL, MAX_TTL);
    }

    /// Check whether the packet being timed is still within its TTL budget.
    ///
    /// Returns `Ok(true)` while the reply may still arrive. On expiry the
    /// estimator widens (the timeout may have been congestion, not loss),
    /// stops itself, and returns `Ok(false)`.
    pub fn within_ttl(&mut self) -> Result<bool, NotRunning> {
        self.within_ttl_at(Instant::now())
    }

    pub fn within_ttl_at(&mut self, now: Instant) -> Result<bool, NotRunning> {
        let started = self.started_at.ok_or(NotRunning)?;
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed <= self.ttl {
            return Ok(true);
        }
        self.rtt_avg = (self.rtt_avg + 0.5).min(MAX_AVG);
        self.rtt_sum = 5.0 * self.rtt_avg;
        self.rtt_count = 5;
        self.ttl = (3.0 * self.rtt_avg).clamp(MIN_TTL, MAX_TTL);
        self.started_at = None;
        Ok(false)
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs_f64(self.ttl)
    }

    pub fn rtt_avg(&self) -> f64 {
        self.rtt_avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn initial_values() {
        let rtt = RttEstimator::new();
        assert!(!rtt.is_running());
        assert_eq!(rtt.rtt_avg(), 0.5);
        assert_eq!(rtt.ttl(), Duration::from_secs_f64(1.5));
    }

    #[test]
    fn within_ttl_requires_running_timer() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.within_ttl_at(Instant::now()), Err(NotRunning));
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let mut rtt = RttEstimator::new();
        rtt.stop_at(Instant::now());
        assert_eq!(rtt.rtt_avg(), 0.5);
    }

    #[test]
    fn fast_replies_shrink_the_ttl_to_its_floor() {
        let mut rtt = RttEstimator::new();
        let mut now = Instant::now();
        for _ in 0..10 {
            rtt.start_at(now);
            now += ms(20);
            rtt.stop_at(now);
        }
        assert!(rtt.rtt_avg() < 0.2);
        assert_eq!(rtt.ttl(), Duration::from_secs_f64(0.5));
        assert!(!rtt.is_running());
    }

    #[test]
    fn zero_elapsed_sample_is_promoted() {
        let mut rtt = RttEstimator::new();
        let now = Instant::now();
        rtt.start_at(now);
        rtt.stop_at(now);
        // (0.5 + 0.5) / 2
        assert_eq!(rtt.rtt_avg(), 0.5);
    }

    #[test]
    fn slow_replies_cap_the_average_and_ttl() {
        let mut rtt = RttEstimator::new();
        let mut now = Instant::now();
        for _ in 0..30 {
            rtt.start_at(now);
            now += Duration::from_secs(10);
            rtt.stop_at(now);
        }
        assert!(rtt.rtt_avg() <= 2.0);
        assert!(rtt.ttl() <= Duration::from_secs(5));
    }

    #[test]
    fn history_is_bounded_after_twenty_samples() {
        let mut rtt = RttEstimator::new();
        let mut now = Instant::now();
        for _ in 0..25 {
            rtt.start_at(now);
            now += ms(100);
            rtt.stop_at(now);
        }
        assert!(rtt.rtt_count <= 21);
        assert!(rtt.rtt_avg() >= 0.01 && rtt.rtt_avg() <= 2.0);
    }

    #[test]
    fn expiry_widens_and_stops_the_timer() {
        let mut rtt = RttEstimator::new();
        let now = Instant::now();
        rtt.start_at(now);
        let avg_before = rtt.rtt_avg();
        let verdict = rtt.within_ttl_at(now + Duration::from_secs(6));
        assert_eq!(verdict, Ok(false));
        assert!(!rtt.is_running());
        assert_eq!(rtt.rtt_avg(), (avg_before + 0.5).min(2.0));
        assert_eq!(rtt.ttl(), Duration::from_secs_f64(3.0));
    }

    #[test]
    fn ttl_is_respected_before_expiry() {
        let mut rtt = RttEstimator::new();
        let now = Instant::now();
        rtt.start_at(now);
        assert_eq!(rtt.within_ttl_at(now + ms(100)), Ok(true));
        assert!(rtt.is_running());
    }

    #[test]
    fn repeated_expiries_keep_ttl_within_bounds() {
        let mut rtt = RttEstimator::new();
        let mut now = Instant::now();
        for _ in 0..10 {
            rtt.start_at(now);
            now += Duration::from_secs(10);
            assert_eq!(rtt.within_ttl_at(now), Ok(false));
            assert!(rtt.ttl() >= Duration::from_secs_f64(0.5));
            assert!(rtt.ttl() <= Duration::from_secs(5));
        }
        assert_eq!(rtt.rtt_avg(), 2.0);
    }
}
