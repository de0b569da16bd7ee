//! Power State Machine.
//!
//! The node owns exactly one [`PowerState`], shared by handle with every
//! component that reads or resets the activity clock. The power mode is never
//! stored as mutable state of its own: it is derived from `(now, last_activity)`
//! every time it is read, so there is no background timer to keep in sync.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::models::{PowerMode, SystemState};

// ---

/// Derive the power mode from the time elapsed since the last activity.
///
/// `< idle_timeout` is active, `< 2 * idle_timeout` is idle, anything longer
/// is sleep. Negative elapsed time (clock stepped backwards) counts as active.
pub fn mode_for(elapsed: Duration, idle_timeout: Duration) -> PowerMode {
    // ---
    if elapsed < idle_timeout {
        PowerMode::Active
    } else if elapsed < idle_timeout * 2 {
        PowerMode::Idle
    } else {
        PowerMode::Sleep
    }
}

#[derive(Debug)]
struct Activity {
    last_activity: DateTime<Utc>,
    ml_last_run: Option<DateTime<Utc>>,
    last_reported: PowerMode,
}

/// The process-wide activity/power record.
#[derive(Debug)]
pub struct PowerState {
    idle_timeout: Duration,
    inner: Mutex<Activity>,
}

impl PowerState {
    // ---
    /// Start in `active` mode with the activity clock set to now.
    ///
    /// `ml_last_run` may be carried over from a previous process.
    pub fn new(idle_timeout: Duration, ml_last_run: Option<DateTime<Utc>>) -> Self {
        Self::starting_at(Utc::now(), idle_timeout, ml_last_run)
    }

    pub fn starting_at(
        now: DateTime<Utc>,
        idle_timeout: Duration,
        ml_last_run: Option<DateTime<Utc>>,
    ) -> Self {
        // ---
        Self {
            idle_timeout,
            inner: Mutex::new(Activity {
                last_activity: now,
                ml_last_run,
                last_reported: PowerMode::Active,
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn snapshot(&self) -> SystemState {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> SystemState {
        // ---
        let inner = self.inner.lock();
        self.state_of(&inner, now)
    }

    /// Reset the activity clock; the node is active afterwards.
    pub fn record_activity(&self) -> SystemState {
        self.record_activity_at(Utc::now())
    }

    pub fn record_activity_at(&self, now: DateTime<Utc>) -> SystemState {
        // ---
        let mut inner = self.inner.lock();
        inner.last_activity = now;
        inner.last_reported = PowerMode::Active;
        self.state_of(&inner, now)
    }

    /// Explicit wake: unconditionally back to `active`, whatever the prior mode.
    pub fn wake(&self) -> SystemState {
        self.wake_at(Utc::now())
    }

    pub fn wake_at(&self, now: DateTime<Utc>) -> SystemState {
        // ---
        let previous = self.snapshot_at(now).power_mode;
        let state = self.record_activity_at(now);
        if previous != PowerMode::Active {
            tracing::info!("System awakened from {} mode", previous);
        }
        state
    }

    /// Stamp completion of an anomaly-detection run.
    pub fn record_analysis_run(&self) -> SystemState {
        // ---
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.ml_last_run = Some(now);
        self.state_of(&inner, now)
    }

    /// Periodic evaluation: returns the new state only when the derived mode
    /// differs from the one seen at the previous tick or activity reset.
    pub fn tick(&self) -> Option<SystemState> {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&self, now: DateTime<Utc>) -> Option<SystemState> {
        // ---
        let mut inner = self.inner.lock();
        let state = self.state_of(&inner, now);
        if state.power_mode == inner.last_reported {
            return None;
        }
        inner.last_reported = state.power_mode;
        Some(state)
    }

    fn state_of(&self, inner: &Activity, now: DateTime<Utc>) -> SystemState {
        SystemState {
            last_activity: inner.last_activity,
            power_mode: mode_for(now - inner.last_activity, self.idle_timeout),
            ml_last_run: inner.ml_last_run,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn machine() -> PowerState {
        PowerState::starting_at(t0(), Duration::seconds(300), None)
    }

    #[test]
    fn test_transition_boundaries() {
        // ---
        let timeout = Duration::seconds(300);
        assert_eq!(mode_for(Duration::zero(), timeout), PowerMode::Active);
        assert_eq!(mode_for(Duration::seconds(299), timeout), PowerMode::Active);
        assert_eq!(mode_for(Duration::seconds(300), timeout), PowerMode::Idle);
        assert_eq!(mode_for(Duration::seconds(599), timeout), PowerMode::Idle);
        assert_eq!(mode_for(Duration::seconds(600), timeout), PowerMode::Sleep);
        assert_eq!(mode_for(Duration::seconds(-5), timeout), PowerMode::Active);
    }

    #[test]
    fn test_mode_is_derived_lazily_on_read() {
        // ---
        let power = machine();
        assert_eq!(power.snapshot_at(t0()).power_mode, PowerMode::Active);
        assert_eq!(
            power.snapshot_at(t0() + Duration::seconds(400)).power_mode,
            PowerMode::Idle
        );
        assert_eq!(
            power.snapshot_at(t0() + Duration::hours(1)).power_mode,
            PowerMode::Sleep
        );
    }

    #[test]
    fn test_wake_always_lands_in_active() {
        // ---
        let power = machine();

        // already active
        assert_eq!(power.wake_at(t0()).power_mode, PowerMode::Active);

        // from sleep
        let later = t0() + Duration::hours(2);
        assert_eq!(power.snapshot_at(later).power_mode, PowerMode::Sleep);
        let state = power.wake_at(later);
        assert_eq!(state.power_mode, PowerMode::Active);
        assert_eq!(state.last_activity, later);
    }

    #[test]
    fn test_activity_resets_clock() {
        // ---
        let power = machine();
        let idle_at = t0() + Duration::seconds(350);
        assert_eq!(power.snapshot_at(idle_at).power_mode, PowerMode::Idle);

        power.record_activity_at(idle_at);
        assert_eq!(
            power.snapshot_at(idle_at + Duration::seconds(10)).power_mode,
            PowerMode::Active
        );
    }

    #[test]
    fn test_tick_reports_each_change_once() {
        // ---
        let power = machine();
        assert_eq!(power.tick_at(t0() + Duration::seconds(10)), None);

        let idle = power.tick_at(t0() + Duration::seconds(301)).unwrap();
        assert_eq!(idle.power_mode, PowerMode::Idle);
        assert_eq!(power.tick_at(t0() + Duration::seconds(302)), None);

        let sleep = power.tick_at(t0() + Duration::seconds(601)).unwrap();
        assert_eq!(sleep.power_mode, PowerMode::Sleep);

        power.record_activity_at(t0() + Duration::seconds(700));
        assert_eq!(power.tick_at(t0() + Duration::seconds(701)), None);
    }

    #[test]
    fn test_analysis_run_is_recorded() {
        // ---
        let power = machine();
        assert_eq!(power.snapshot().ml_last_run, None);
        assert!(power.record_analysis_run().ml_last_run.is_some());
    }
}
