/// Shared machine state: the axis pair, the arm position and the last move's
/// timing, all behind one mutex.

use crate::arm::ArmPosition;
use crate::axis::{Axis, AxisId, Positions};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    axes: [Axis; 2],
    arm: ArmPosition,
    last_duration: Duration,
    last_error: Option<String>,
}

/// Point-in-time copy of the state for status replies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub positions: Positions,
    pub enabled: [bool; 2],
    pub current_position: ArmPosition,
    pub last_duration: f64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct MotionState {
    inner: Mutex<Inner>,
}

impl Default for MotionState {
    fn default() -> Self {
        Self::new(Positions::ORIGIN)
    }
}

impl MotionState {
    pub fn new(start: Positions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                axes: [Axis::new(start.a), Axis::new(start.b)],
                arm: ArmPosition::Idle,
                last_duration: Duration::ZERO,
                last_error: None,
            }),
        }
    }

    // A poisoned lock still holds consistent data: every write is a single
    // assignment.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn positions(&self) -> Positions {
        let inner = self.lock();
        Positions::new(inner.axes[0].position(), inner.axes[1].position())
    }

    pub fn axes(&self) -> [Axis; 2] {
        self.lock().axes
    }

    pub fn is_enabled(&self, axis: AxisId) -> bool {
        self.lock().axes[axis.index()].enabled()
    }

    /// Commit `target` to every enabled axis and return the resulting pair.
    pub fn commit(&self, target: Positions) -> Positions {
        let mut inner = self.lock();
        for axis in AxisId::ALL {
            inner.axes[axis.index()].commit(target.get(axis));
        }
        Positions::new(inner.axes[0].position(), inner.axes[1].position())
    }

    /// Commit `reached` to the axes in `stepped`, the mask a move was planned
    /// with. Enable flags flipped while the move ran are ignored.
    pub fn commit_stepped(&self, reached: Positions, stepped: [bool; 2]) -> Positions {
        let mut inner = self.lock();
        for axis in AxisId::ALL {
            if stepped[axis.index()] {
                inner.axes[axis.index()].track(reached.get(axis));
            }
        }
        Positions::new(inner.axes[0].position(), inner.axes[1].position())
    }

    /// Zero both counters regardless of the enabled flags.
    pub fn calibrate(&self) {
        let mut inner = self.lock();
        for axis in inner.axes.iter_mut() {
            axis.calibrate();
        }
    }

    pub fn set_axis_enabled(&self, axis: AxisId, enabled: bool) {
        self.lock().axes[axis.index()].set_enabled(enabled);
    }

    pub fn arm_position(&self) -> ArmPosition {
        self.lock().arm
    }

    /// Set the arm position and return the previous one.
    pub fn set_arm_position(&self, position: ArmPosition) -> ArmPosition {
        std::mem::replace(&mut self.lock().arm, position)
    }

    /// Move the arm to `next` unless `skip` says the current state already
    /// covers it. Check and claim happen under one lock. Returns the previous
    /// position when claimed, `None` when skipped.
    pub fn claim_arm_position(
        &self,
        next: ArmPosition,
        skip: impl FnOnce(ArmPosition, Positions) -> bool,
    ) -> Option<ArmPosition> {
        let mut inner = self.lock();
        let at = Positions::new(inner.axes[0].position(), inner.axes[1].position());
        if skip(inner.arm, at) {
            return None;
        }
        Some(std::mem::replace(&mut inner.arm, next))
    }

    /// Undo a claim, but only if nobody has moved the arm position since.
    pub fn release_arm_position(&self, claimed: ArmPosition, previous: ArmPosition) -> bool {
        let mut inner = self.lock();
        if inner.arm != claimed {
            return false;
        }
        inner.arm = previous;
        true
    }

    pub fn last_duration(&self) -> Duration {
        self.lock().last_duration
    }

    pub fn set_last_duration(&self, elapsed: Duration) {
        self.lock().last_duration = elapsed;
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn set_last_error(&self, error: Option<String>) {
        self.lock().last_error = error;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.lock();
        StateSnapshot {
            positions: Positions::new(inner.axes[0].position(), inner.axes[1].position()),
            enabled: [inner.axes[0].enabled(), inner.axes[1].enabled()],
            current_position: inner.arm,
            last_duration: inner.last_duration.as_secs_f64(),
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_skips_disabled_axis() {
        let state = MotionState::default();
        state.set_axis_enabled(AxisId::B, false);
        let after = state.commit(Positions::new(200, -200));
        assert_eq!(after, Positions::new(200, 0));
        assert_eq!(state.positions(), after);
    }

    #[test]
    fn test_commit_stepped_follows_plan_mask() {
        let state = MotionState::new(Positions::new(10, 10));
        state.set_axis_enabled(AxisId::A, false);
        // A was planned and pulsed before being disabled; B was not planned
        let after = state.commit_stepped(Positions::new(50, 90), [true, false]);
        assert_eq!(after, Positions::new(50, 10));
    }

    #[test]
    fn test_calibrate_zeroes_disabled_axis_too() {
        let state = MotionState::new(Positions::new(40, 55));
        state.set_axis_enabled(AxisId::A, false);
        state.calibrate();
        assert_eq!(state.positions(), Positions::ORIGIN);
        assert!(!state.is_enabled(AxisId::A));
    }

    #[test]
    fn test_claim_is_skipped_when_already_there() {
        let state = MotionState::default();
        assert_eq!(state.claim_arm_position(ArmPosition::Dip, |cur, _| cur == ArmPosition::Dip), Some(ArmPosition::Idle));
        assert_eq!(state.claim_arm_position(ArmPosition::Dip, |cur, _| cur == ArmPosition::Dip), None);
        assert_eq!(state.arm_position(), ArmPosition::Dip);
    }

    #[test]
    fn test_release_does_not_clobber_newer_position() {
        let state = MotionState::default();
        let previous = state.claim_arm_position(ArmPosition::Dip, |_, _| false).unwrap();
        state.set_arm_position(ArmPosition::Close);
        assert!(!state.release_arm_position(ArmPosition::Dip, previous));
        assert_eq!(state.arm_position(), ArmPosition::Close);

        let previous = state.claim_arm_position(ArmPosition::Open, |_, _| false).unwrap();
        assert!(state.release_arm_position(ArmPosition::Open, previous));
        assert_eq!(state.arm_position(), ArmPosition::Close);
    }

    #[test]
    fn test_set_arm_position_returns_previous() {
        let state = MotionState::default();
        assert_eq!(state.set_arm_position(ArmPosition::Dip), ArmPosition::Idle);
        assert_eq!(state.arm_position(), ArmPosition::Dip);
        let snap = state.snapshot();
        assert_eq!(snap.current_position, ArmPosition::Dip);
        assert_eq!(snap.enabled, [true, true]);
    }
}
