//! Process-wide cooperative drain.
//!
//! Draining lets a worker shed view-syncer instances one at a time so
//! another worker can take ownership without a thundering herd. The
//! coordinator holds a single `next_drain_time`; each view-syncer checks
//! [`DrainCoordinator::should_drain`] at its iteration boundary and, when
//! it elects to exit, schedules the next drain far enough out that drain
//! work stays a small fraction of total work.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Fraction of wall-clock time the fleet is allowed to spend
/// re-hydrating drained view-syncers.
pub const TARGET_UTILIZATION: f64 = 0.05;

/// Small spacer so that back-to-back zero-cost hydrations cannot drain
/// the whole process at once.
pub const FORCE_DRAIN_PADDING: Duration = Duration::from_millis(2);

#[derive(Default)]
pub struct DrainCoordinator {
    next_drain_time: Mutex<Option<Instant>>,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a drain is scheduled and due.
    pub fn should_drain(&self) -> bool {
        self.next_drain_time
            .lock()
            .expect("drain time")
            .is_some_and(|t| t <= Instant::now())
    }

    /// Requests an immediate drain.
    pub fn force_drain(&self) {
        *self
            .next_drain_time
            .lock()
            .expect("drain time") = Some(Instant::now());
    }

    /// Called by a draining view-syncer with its last hydration time;
    /// spaces the next drain so re-hydration stays under
    /// [`TARGET_UTILIZATION`].
    pub fn drain_next_in(&self, hydration_time: Duration) {
        let spacing = hydration_time.div_f64(TARGET_UTILIZATION) + FORCE_DRAIN_PADDING;
        *self
            .next_drain_time
            .lock()
            .expect("drain time") = Some(Instant::now() + spacing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_coordinator_never_drains() {
        let coordinator = DrainCoordinator::new();
        assert!(!coordinator.should_drain());
    }

    #[test]
    fn force_drain_is_immediate() {
        let coordinator = DrainCoordinator::new();
        coordinator.force_drain();
        assert!(coordinator.should_drain());
    }

    #[test]
    fn drains_are_spaced_by_hydration_work() {
        let coordinator = DrainCoordinator::new();
        coordinator.force_drain();
        assert!(coordinator.should_drain());

        // One view-syncer drained; the next drain is pushed out by its
        // hydration time scaled to the utilization target.
        coordinator.drain_next_in(Duration::from_secs(1));
        assert!(!coordinator.should_drain());

        let next = coordinator
            .next_drain_time
            .lock()
            .unwrap()
            .unwrap();
        let spacing = next - Instant::now();
        assert!(spacing > Duration::from_secs(19), "{spacing:?}");
        assert!(spacing <= Duration::from_secs(20) + FORCE_DRAIN_PADDING, "{spacing:?}");
    }

    #[test]
    fn zero_cost_hydration_still_pads() {
        let coordinator = DrainCoordinator::new();
        coordinator.drain_next_in(Duration::ZERO);
        assert!(!coordinator.should_drain());
    }
}
