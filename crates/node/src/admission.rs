//! Admission control
//!
//! Gates whether a new job may start processing. Two limits apply: a cap on
//! concurrently running jobs and a minimum spacing between two admissions.
//! Both are evaluated against one consistent snapshot under a single lock.
//! Which model a job asks for plays no part here.

use crate::capacity::CapacitySettings;
use clusterloop_common::METRICS;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Live admission counters
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmissionState {
    pub in_flight_count: usize,
    pub last_admission_at: Option<Instant>,
}

/// Admission controller shared by the poller and every worker
#[derive(Debug)]
pub struct AdmissionController {
    /// Fixed for the process lifetime, so it is read without locking
    settings: CapacitySettings,

    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// Create a controller with zeroed counters
    pub fn new(settings: CapacitySettings) -> Self {
        Self {
            settings,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn settings(&self) -> &CapacitySettings {
        &self.settings
    }

    /// Try to start one job.
    ///
    /// Returns false without touching any counter when the last admission is
    /// too recent or every slot is taken.
    pub fn try_admit(&self) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(last) = state.last_admission_at {
            if now.saturating_duration_since(last) < self.settings.min_interval_between_admissions {
                trace!("Admission denied: interval gate");
                return false;
            }
        }

        if state.in_flight_count >= self.settings.max_in_flight_requests {
            trace!(
                "Admission denied: {} of {} slots in use",
                state.in_flight_count,
                self.settings.max_in_flight_requests
            );
            return false;
        }

        state.last_admission_at = Some(now);
        state.in_flight_count += 1;
        METRICS.intake.jobs_in_flight.inc();
        true
    }

    /// Give back one slot. Floored at zero.
    pub fn release(&self) {
        let mut state = self.state.lock();

        if state.in_flight_count == 0 {
            warn!("Admission release without a matching admit");
            return;
        }

        state.in_flight_count -= 1;
        METRICS.intake.jobs_in_flight.dec();
    }

    /// Free slots right now. Advisory: may be stale as soon as it returns.
    pub fn available_slots(&self) -> usize {
        let state = self.state.lock();
        self.settings
            .max_in_flight_requests
            .saturating_sub(state.in_flight_count)
    }

    /// Jobs currently admitted
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight_count
    }

    pub fn snapshot(&self) -> AdmissionState {
        *self.state.lock()
    }

    /// Admit and wrap the slot in a guard that releases it on drop
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        if self.try_admit() {
            Some(AdmissionPermit {
                controller: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

/// One admitted slot; released exactly once when dropped
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller(max: usize, interval_ms: u64) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(CapacitySettings::new(
            max,
            Duration::from_millis(interval_ms),
        )))
    }

    #[test]
    fn test_concurrency_cap() {
        let admission = controller(2, 0);

        assert!(admission.try_admit());
        assert!(admission.try_admit());
        assert!(!admission.try_admit());
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(admission.available_slots(), 0);

        admission.release();
        assert!(admission.try_admit());
        assert_eq!(admission.in_flight(), 2);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let admission = controller(1, 0);

        admission.release();
        admission.release();
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.available_slots(), 1);
    }

    #[test]
    fn test_zero_capacity_never_admits() {
        let admission = controller(0, 0);
        assert!(!admission.try_admit());
        assert_eq!(admission.available_slots(), 0);
    }

    #[test]
    fn test_count_stays_in_bounds() {
        let admission = controller(3, 0);
        let mut expected = 0usize;

        for step in 0..200 {
            if step % 3 == 2 {
                admission.release();
                expected = expected.saturating_sub(1);
            } else if admission.try_admit() {
                expected += 1;
            }

            let in_flight = admission.in_flight();
            assert_eq!(in_flight, expected);
            assert!(in_flight <= 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_gate() {
        let admission = controller(10, 500);

        assert!(admission.try_admit());
        let before = admission.snapshot();

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!admission.try_admit());

        let after = admission.snapshot();
        assert_eq!(after.in_flight_count, before.in_flight_count);
        assert_eq!(after.last_admission_at, before.last_admission_at);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(admission.try_admit());
        assert_eq!(admission.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_admission_does_not_reset_interval() {
        let admission = controller(10, 100);

        assert!(admission.try_admit());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!admission.try_admit());
        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(admission.try_admit());
    }

    #[test]
    fn test_three_contenders_two_slots() {
        let admission = controller(2, 0);

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let admission = Arc::clone(&admission);
                std::thread::spawn(move || admission.try_admit())
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 2);
        assert!(!admission.try_admit());

        admission.release();
        assert!(admission.try_admit());
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let admission = controller(1, 0);

        let permit = admission.try_acquire().unwrap();
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.in_flight(), 1);

        drop(permit);
        assert_eq!(admission.in_flight(), 0);
        assert!(admission.try_acquire().is_some());
    }
}
