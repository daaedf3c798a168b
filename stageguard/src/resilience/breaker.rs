//! Per-stage circuit breakers and the process-wide registry that owns them.
//!
//! CLOSED opens after `failure_threshold` consecutive failures. OPEN rejects
//! every attempt until `cooldown` has elapsed, then admits exactly one
//! HALF_OPEN probe. A successful probe closes the breaker; a failed probe
//! re-opens it with a fresh cooldown.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::ConfigError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Attempts flow normally.
    #[default]
    Closed,
    /// Attempts are rejected until the cooldown elapses.
    Open,
    /// One probe attempt is allowed.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "opened"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open breaker rejects attempts before allowing a probe.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> f64 {
    60.0
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl BreakerConfig {
    /// Creates a breaker config.
    #[must_use]
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown_seconds: cooldown.as_secs_f64(),
        }
    }

    /// Returns the cooldown as a duration.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::try_from_secs_f64(self.cooldown_seconds).unwrap_or_default()
    }

    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !self.cooldown_seconds.is_finite() || self.cooldown_seconds < 0.0 {
            return Err(ConfigError::Invalid(
                "breaker.cooldown_seconds must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }
}

/// The answer to "may I call the collaborator now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker is closed.
    Allowed,
    /// The cooldown elapsed; this caller holds the single half-open probe.
    Probe,
    /// The breaker is open, or another probe is in flight.
    Rejected,
}

impl Admission {
    /// Returns true if the attempt may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Durable view of a breaker, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// The stage the breaker guards.
    pub stage_id: String,
    /// State at snapshot time.
    pub state: BreakerState,
    /// Consecutive failures counted.
    pub consecutive_failures: u32,
    /// Wall-clock time the breaker last opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.probe_in_flight = false;
    }
}

/// A circuit breaker guarding one stage's collaborator.
#[derive(Debug)]
pub struct CircuitBreaker {
    stage_id: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            stage_id: stage_id.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
        }
    }

    /// The guarded stage.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failures counted since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Asks to dispatch an attempt, claiming the half-open probe if one is due.
    pub fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown());
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Returns true if an attempt may be dispatched now.
    pub fn may_attempt(&self) -> bool {
        self.admit().is_allowed()
    }

    /// Resets the counter and forces CLOSED. Returns the new state if it changed.
    pub fn record_success(&self) -> Option<BreakerState> {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_in_flight = false;
        (previous != BreakerState::Closed).then_some(BreakerState::Closed)
    }

    /// Counts a failure. Returns `Some(Open)` if this failure opened the breaker.
    pub fn record_failure(&self) -> Option<BreakerState> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.open();
                Some(BreakerState::Open)
            }
            BreakerState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.open();
                Some(BreakerState::Open)
            }
            BreakerState::Closed | BreakerState::Open => None,
        }
    }

    /// Gives back an unfinished probe (the attempt was cancelled, not failed).
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Ties the half-open trial claimed by `admission` to a guard. Dropping
    /// the guard before the attempt is recorded gives the trial slot back.
    pub fn guard_trial(&self, admission: Admission) -> TrialGuard<'_> {
        TrialGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        }
    }

    /// Forces CLOSED with a zero counter.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::default();
    }

    /// Captures the durable state.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            stage_id: self.stage_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at_wall,
        }
    }

    /// Restores state captured by [`CircuitBreaker::snapshot`].
    ///
    /// An interrupted half-open probe comes back as OPEN with its original
    /// open time, so it is re-admitted once the cooldown has passed.
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = snapshot.consecutive_failures;
        inner.probe_in_flight = false;
        match snapshot.state {
            BreakerState::Closed => {
                inner.state = BreakerState::Closed;
                inner.opened_at = None;
                inner.opened_at_wall = None;
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                let opened_wall = snapshot.opened_at.unwrap_or_else(Utc::now);
                let elapsed = (Utc::now() - opened_wall).to_std().unwrap_or_default();
                let now = Instant::now();
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now.checked_sub(elapsed).unwrap_or(now));
                inner.opened_at_wall = Some(opened_wall);
            }
        }
    }
}

/// Holds a claimed half-open trial until the attempt's outcome is recorded.
///
/// If the attempt never reaches [`TrialGuard::disarm`], for instance because
/// the executing future was dropped, the slot is released on drop so the
/// breaker does not stay half-open with no attempt in flight.
#[derive(Debug)]
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    /// Marks the trial as settled by `record_success` or `record_failure`.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

/// Process-wide breakers keyed by stage id.
///
/// Shared by every run in the process so that one run's failures protect the
/// others. Inject one registry per supervisor; tests use an isolated registry.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    overrides: DashMap<String, BreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers use `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Uses a different config for one stage. Applies to breakers created afterwards.
    pub fn configure_stage(&self, stage_id: impl Into<String>, config: BreakerConfig) {
        self.overrides.insert(stage_id.into(), config);
    }

    /// Returns the breaker for a stage, creating a closed one on first use.
    pub fn get(&self, stage_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(stage_id) {
            return existing.clone();
        }
        self.breakers
            .entry(stage_id.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(stage_id)
                    .map_or_else(|| self.config.clone(), |c| c.clone());
                Arc::new(CircuitBreaker::new(stage_id, config))
            })
            .clone()
    }

    /// Returns the state of a stage's breaker, if one exists.
    #[must_use]
    pub fn state(&self, stage_id: &str) -> Option<BreakerState> {
        self.breakers.get(stage_id).map(|b| b.state())
    }

    /// Forces a stage's breaker CLOSED.
    pub fn reset(&self, stage_id: &str) {
        self.get(stage_id).reset();
    }

    /// Snapshots every breaker, ordered by stage id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        snapshots
    }

    /// Restores snapshots for stages this registry has not seen yet.
    ///
    /// Live breakers are never overwritten. Returns the number restored.
    pub fn restore_missing(&self, snapshots: &[BreakerSnapshot]) -> usize {
        let mut restored = 0;
        for snapshot in snapshots {
            if self.breakers.contains_key(&snapshot.stage_id) {
                continue;
            }
            self.get(&snapshot.stage_id).restore(snapshot);
            restored += 1;
        }
        restored
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new("stage", BreakerConfig::new(threshold, Duration::from_secs(cooldown_secs)))
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
        assert!(BreakerConfig::new(0, Duration::ZERO).validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let b = breaker(3, 60);
        assert_eq!(b.record_failure(), None);
        assert_eq!(b.record_failure(), None);
        assert!(b.may_attempt());
        assert_eq!(b.record_failure(), Some(BreakerState::Open));
        assert!(!b.may_attempt());
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_probe_after_cooldown() {
        let b = breaker(1, 60);
        b.record_failure();
        assert_eq!(b.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(b.admit(), Admission::Rejected);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.admit(), Admission::Probe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.admit(), Admission::Rejected);
        assert_eq!(b.admit(), Admission::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let b = breaker(1, 10);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(b.admit(), Admission::Probe);
        assert_eq!(b.record_success(), Some(BreakerState::Closed));
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fresh_cooldown() {
        let b = breaker(1, 10);
        b.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(b.admit(), Admission::Probe);
        assert_eq!(b.record_failure(), Some(BreakerState::Open));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(b.admit(), Admission::Rejected);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(b.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_reclaimed() {
        let b = breaker(1, 0);
        b.record_failure();
        assert_eq!(b.admit(), Admission::Probe);
        b.release_probe();
        assert_eq!(b.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_guard_frees_half_open_slot() {
        let b = breaker(1, 0);
        b.record_failure();
        {
            let _held = b.guard_trial(b.admit());
            assert_eq!(b.admit(), Admission::Rejected);
        }
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_trial_guard_keeps_recorded_outcome() {
        let b = breaker(1, 0);
        b.record_failure();
        let mut held = b.guard_trial(b.admit());
        b.record_failure();
        held.disarm();
        let reclaimed = b.admit();
        drop(held);
        assert_eq!(reclaimed, Admission::Probe);
        assert_eq!(b.admit(), Admission::Rejected);
    }

    #[test]
    fn test_success_resets_counter() {
        let b = breaker(3, 60);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.record_success(), None);
        assert_eq!(b.consecutive_failures(), 0);
        b.record_failure();
        b.record_failure();
        assert!(b.may_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_restore_keeps_open_state() {
        let b = breaker(1, 60);
        b.record_failure();
        let snapshot = b.snapshot();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert!(snapshot.opened_at.is_some());

        let restored = breaker(1, 60);
        restored.restore(&snapshot);
        assert_eq!(restored.state(), BreakerState::Open);
        assert!(!restored.may_attempt());
        assert_eq!(restored.consecutive_failures(), 1);
    }

    #[test]
    fn test_registry_shares_breakers_per_stage() {
        let registry = BreakerRegistry::new(BreakerConfig::new(2, Duration::from_secs(60)));
        let a1 = registry.get("a");
        let a2 = registry.get("a");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &registry.get("b")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_stage_override() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        registry.configure_stage("fragile", BreakerConfig::new(1, Duration::from_secs(60)));
        let fragile = registry.get("fragile");
        assert_eq!(fragile.record_failure(), Some(BreakerState::Open));
        assert_eq!(registry.get("sturdy").record_failure(), None);
    }

    #[test]
    fn test_registry_restore_missing_does_not_clobber() {
        let registry = BreakerRegistry::new(BreakerConfig::new(1, Duration::from_secs(60)));
        registry.get("live");

        let snapshots = vec![
            BreakerSnapshot {
                stage_id: "live".to_string(),
                state: BreakerState::Open,
                consecutive_failures: 4,
                opened_at: Some(Utc::now()),
            },
            BreakerSnapshot {
                stage_id: "cold".to_string(),
                state: BreakerState::Open,
                consecutive_failures: 4,
                opened_at: Some(Utc::now()),
            },
        ];

        assert_eq!(registry.restore_missing(&snapshots), 1);
        assert_eq!(registry.state("live"), Some(BreakerState::Closed));
        assert_eq!(registry.state("cold"), Some(BreakerState::Open));
    }

    #[test]
    fn test_registry_reset() {
        let registry = BreakerRegistry::new(BreakerConfig::new(1, Duration::from_secs(60)));
        registry.get("x").record_failure();
        assert_eq!(registry.state("x"), Some(BreakerState::Open));
        registry.reset("x");
        assert_eq!(registry.state("x"), Some(BreakerState::Closed));
    }
}
