//! Health status of the service a worker runs.
//!
//! The worker polls its own health route. [`HealthTracker`] turns each poll
//! outcome into a [`PollVerdict`]; the worker acts on the verdict.

use serde::{Deserialize, Serialize};

/// Whether the worker currently expects the service to answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Booting; no successful poll yet (or none since the last outage).
    #[default]
    Unresponsive,
    /// The last poll succeeded.
    Healthy,
}

/// What a single poll outcome means for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    /// First success, or first success after an outage.
    BecameHealthy { is_first_time: bool },
    StillHealthy,
    /// A failure within tolerance.
    Tolerated { failures: u32, tolerance: u32 },
    /// A failure while the service was not expected to answer yet.
    Ignored,
    /// Failures exceeded the tolerance; the worker must crash.
    Exhausted { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    tolerance: u32,
    failures: u32,
    health: Health,
    initialized: bool,
}

impl HealthTracker {
    pub fn new(tolerance: u32) -> Self {
        Self {
            tolerance,
            failures: 0,
            health: Health::Unresponsive,
            initialized: false,
        }
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) -> PollVerdict {
        self.failures = 0;
        if self.health == Health::Healthy {
            return PollVerdict::StillHealthy;
        }
        self.health = Health::Healthy;
        let is_first_time = !self.initialized;
        self.initialized = true;
        PollVerdict::BecameHealthy { is_first_time }
    }

    pub fn record_failure(&mut self) -> PollVerdict {
        if self.health != Health::Healthy {
            return PollVerdict::Ignored;
        }
        self.failures += 1;
        if self.failures > self.tolerance {
            self.health = Health::Unresponsive;
            PollVerdict::Exhausted {
                failures: self.failures,
            }
        } else {
            PollVerdict::Tolerated {
                failures: self.failures,
                tolerance: self.tolerance,
            }
        }
    }

    /// Stop expecting the service to answer (the worker is going down).
    pub fn mark_unresponsive(&mut self) {
        self.health = Health::Unresponsive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy(tolerance: u32) -> HealthTracker {
        let mut tracker = HealthTracker::new(tolerance);
        tracker.record_success();
        tracker
    }

    #[test]
    fn health_default_is_unresponsive() {
        assert_eq!(Health::default(), Health::Unresponsive);
    }

    #[test]
    fn health_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [Health::Unresponsive, Health::Healthy],
            @r###"
        [
          "UNRESPONSIVE",
          "HEALTHY"
        ]
        "###
        );
    }

    #[test]
    fn failures_while_booting_are_ignored() {
        let mut tracker = HealthTracker::new(0);
        for _ in 0..5 {
            assert_eq!(tracker.record_failure(), PollVerdict::Ignored);
        }
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn first_success_is_reported_once() {
        let mut tracker = HealthTracker::new(0);
        assert_eq!(
            tracker.record_success(),
            PollVerdict::BecameHealthy {
                is_first_time: true
            }
        );
        assert_eq!(tracker.record_success(), PollVerdict::StillHealthy);
    }

    #[test]
    fn zero_tolerance_crashes_on_first_failure() {
        let mut tracker = healthy(0);
        assert_eq!(
            tracker.record_failure(),
            PollVerdict::Exhausted { failures: 1 }
        );
    }

    #[test]
    fn tolerance_two_crashes_on_third_consecutive_failure() {
        let mut tracker = healthy(2);
        assert_eq!(
            tracker.record_failure(),
            PollVerdict::Tolerated {
                failures: 1,
                tolerance: 2
            }
        );
        assert_eq!(
            tracker.record_failure(),
            PollVerdict::Tolerated {
                failures: 2,
                tolerance: 2
            }
        );
        assert_eq!(
            tracker.record_failure(),
            PollVerdict::Exhausted { failures: 3 }
        );
    }

    #[test]
    fn success_resets_the_failure_count() {
        let mut tracker = healthy(1);
        assert!(matches!(
            tracker.record_failure(),
            PollVerdict::Tolerated { failures: 1, .. }
        ));
        assert_eq!(tracker.record_success(), PollVerdict::StillHealthy);
        assert!(matches!(
            tracker.record_failure(),
            PollVerdict::Tolerated { failures: 1, .. }
        ));
    }

    #[test]
    fn recovery_after_outage_is_not_first_time() {
        let mut tracker = healthy(0);
        tracker.mark_unresponsive();
        assert_eq!(
            tracker.record_success(),
            PollVerdict::BecameHealthy {
                is_first_time: false
            }
        );
    }
}
