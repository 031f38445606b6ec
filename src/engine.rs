/// Motion engine - runs one synchronized two-axis step sequence.
///
/// Both axes share the same eased delay per step index; the axis with fewer
/// steps simply stops pulsing early. Positions are committed once, at the end
/// of the move, so readers only ever see pre-move or post-move values.

use crate::axis::{AxisId, Positions};
use crate::error::{MotionError, MotionResult};
use crate::profile::MotionProfile;
use crate::state::MotionState;
use crate::stepper::{DirectionPolarity, StepperOutputs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Jog publishes its running position to the shared state this often.
pub const JOG_COMMIT_INTERVAL: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRequest {
    pub target: Positions,
    pub profile: MotionProfile,
}

impl MotionRequest {
    pub fn new(target: Positions, profile: MotionProfile) -> Self {
        Self { target, profile }
    }
}

/// Outcome of a finished (or preempted) move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveReport {
    pub final_positions: Positions,
    pub elapsed: Duration,
    pub steps: u32,
    pub preempted: bool,
}

/// Per-axis step plan for one move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub start: Positions,
    pub steps: [u32; 2],
    pub forward: [bool; 2],
    /// Axes that were enabled when the move was planned
    pub stepped: [bool; 2],
}

impl StepPlan {
    /// Plan from `start` toward `target`; disabled axes get zero steps.
    pub fn new(start: Positions, target: Positions, enabled: [bool; 2]) -> Self {
        let mut steps = [0u32; 2];
        let mut forward = [true; 2];
        for axis in AxisId::ALL {
            let i = axis.index();
            if !enabled[i] {
                continue;
            }
            let delta = target.get(axis) as i64 - start.get(axis) as i64;
            steps[i] = delta.unsigned_abs() as u32;
            forward[i] = delta >= 0;
        }
        Self { start, steps, forward, stepped: enabled }
    }

    pub fn max_steps(&self) -> u32 {
        self.steps[0].max(self.steps[1])
    }

    /// Where each axis is after `done` step indices have been pulsed.
    pub fn reached(&self, done: u32) -> Positions {
        let mut at = self.start;
        for axis in AxisId::ALL {
            let i = axis.index();
            let moved = self.steps[i].min(done) as i32;
            let signed = if self.forward[i] { moved } else { -moved };
            at.set(axis, self.start.get(axis).saturating_add(signed));
        }
        at
    }
}

pub struct MotionEngine {
    state: Arc<MotionState>,
    outputs: Mutex<Box<dyn StepperOutputs>>,
    polarity: DirectionPolarity,
}

impl MotionEngine {
    pub fn new(state: Arc<MotionState>, outputs: Box<dyn StepperOutputs>, polarity: DirectionPolarity) -> Self {
        Self { state, outputs: Mutex::new(outputs), polarity }
    }

    pub fn state(&self) -> &Arc<MotionState> {
        &self.state
    }

    fn lock_outputs(&self) -> MutexGuard<'_, Box<dyn StepperOutputs>> {
        self.outputs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn plan(&self, target: Positions) -> StepPlan {
        let axes = self.state.axes();
        let start = Positions::new(axes[0].position(), axes[1].position());
        StepPlan::new(start, target, [axes[0].enabled(), axes[1].enabled()])
    }

    pub fn execute(&self, target: Positions, profile: &MotionProfile) -> MotionResult<MoveReport> {
        self.execute_with(target, profile, None)
    }

    /// Execute a move, checking `preempt` once per step index. A preempted
    /// move commits the positions it actually reached.
    pub fn execute_with(
        &self,
        target: Positions,
        profile: &MotionProfile,
        preempt: Option<&AtomicBool>,
    ) -> MotionResult<MoveReport> {
        profile.validate()?;

        let mut outputs = self.lock_outputs();
        let plan = self.plan(target);
        let max_steps = plan.max_steps();
        let started = Instant::now();

        log::debug!(target: "engine", "Move {} -> {} ({} / {} steps)",
                    plan.start, target, plan.steps[0], plan.steps[1]);

        for axis in AxisId::ALL {
            if plan.steps[axis.index()] > 0 {
                let level = self.polarity.level(axis, plan.forward[axis.index()]);
                if let Err(e) = outputs.set_direction(axis, level) {
                    return Err(self.abort(&mut **outputs, axis, e));
                }
            }
        }

        let mut done = 0;
        let mut preempted = false;
        while done < max_steps {
            if preempt.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
                preempted = true;
                break;
            }
            let delay = profile.effective_delay(done, max_steps);
            self.pulse(&mut **outputs, &plan.steps, done, delay)?;
            done += 1;
        }
        drop(outputs);

        let elapsed = started.elapsed();
        let committed = if preempted { plan.reached(done) } else { target };
        let final_positions = self.state.commit_stepped(committed, plan.stepped);
        self.state.set_last_duration(elapsed);

        if preempted {
            log::warn!(target: "engine", "Move preempted after {}/{} steps at {}", done, max_steps, final_positions);
        } else {
            log::info!(target: "engine", "Move complete at {} in {:.3}s", final_positions, elapsed.as_secs_f64());
        }

        Ok(MoveReport { final_positions, elapsed, steps: done, preempted })
    }

    /// One step index: high, wait, low, wait, on every axis with steps left.
    fn pulse(
        &self,
        outputs: &mut dyn StepperOutputs,
        steps: &[u32; 2],
        index: u32,
        delay: Duration,
    ) -> MotionResult<()> {
        for level in [true, false] {
            for axis in AxisId::ALL {
                if steps[axis.index()] > index {
                    if let Err(e) = outputs.set_step(axis, level) {
                        return Err(self.abort(outputs, axis, e));
                    }
                }
            }
            thread::sleep(delay);
        }
        Ok(())
    }

    fn abort(&self, outputs: &mut dyn StepperOutputs, axis: AxisId, e: anyhow::Error) -> MotionError {
        log::error!(target: "engine", "Output write failed on axis {}: {}; move aborted, positions not committed", axis, e);
        for a in AxisId::ALL {
            let _ = outputs.set_step(a, false);
        }
        MotionError::HardwareFault(format!("axis {}: {}", axis, e))
    }

    /// Step `axes` continuously in one direction until `stop` is set or the
    /// travel limit is reached.
    pub fn jog(
        &self,
        axes: &[AxisId],
        forward: bool,
        profile: &MotionProfile,
        travel_limit: i32,
        stop: &AtomicBool,
    ) -> MotionResult<MoveReport> {
        profile.validate()?;

        let mut outputs = self.lock_outputs();
        let snapshot = self.state.axes();
        let active: Vec<AxisId> = axes
            .iter()
            .copied()
            .filter(|a| snapshot[a.index()].enabled())
            .collect();
        let mut stepped = [false; 2];
        for axis in &active {
            stepped[axis.index()] = true;
        }
        let mut at = Positions::new(snapshot[0].position(), snapshot[1].position());
        let started = Instant::now();
        let delay = profile.effective_delay(0, 0);
        let step: i32 = if forward { 1 } else { -1 };

        for &axis in &active {
            if let Err(e) = outputs.set_direction(axis, self.polarity.level(axis, forward)) {
                return Err(self.abort(&mut **outputs, axis, e));
            }
        }

        let mut count = 0u32;
        while !active.is_empty() && !stop.load(Ordering::SeqCst) {
            if active.iter().any(|a| (at.get(*a) + step).abs() > travel_limit) {
                log::warn!(target: "engine", "Jog reached travel limit at {}", at);
                break;
            }
            for level in [true, false] {
                for &axis in &active {
                    if let Err(e) = outputs.set_step(axis, level) {
                        // Jog commits what it has already pulsed.
                        self.state.commit_stepped(at, stepped);
                        return Err(self.abort(&mut **outputs, axis, e));
                    }
                }
                thread::sleep(delay);
            }
            for &axis in &active {
                at.set(axis, at.get(axis) + step);
            }
            count += 1;
            if count % JOG_COMMIT_INTERVAL == 0 {
                self.state.commit_stepped(at, stepped);
            }
        }
        drop(outputs);

        let final_positions = self.state.commit_stepped(at, stepped);
        let elapsed = started.elapsed();
        log::info!(target: "engine", "Jog stopped after {} steps at {}", count, final_positions);
        Ok(MoveReport { final_positions, elapsed, steps: count, preempted: false })
    }

    /// Drive both step lines low unless a move currently holds the outputs.
    pub fn release_outputs(&self) -> bool {
        let mut outputs = match self.outputs.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(e)) => e.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return false,
        };
        for axis in AxisId::ALL {
            if let Err(e) = outputs.set_step(axis, false) {
                log::warn!(target: "engine", "Could not release step line {}: {}", axis, e);
            }
        }
        true
    }
}
