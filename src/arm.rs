/// Arm state machine - maps operator commands to targets, profiles and
/// actuator actions.
///
/// | Command    | Target                               | Skipped when                       |
/// |------------|--------------------------------------|------------------------------------|
/// | IDLE       | none (stop jog, release, fan/smoke off) | never                           |
/// | DIP        | saved dip, else home + dip offset    | already DIP                        |
/// | OPEN       | saved home, else origin              | already OPEN and within tolerance  |
/// | HOME       | saved home, else origin (forced)     | never                              |
/// | CLOSE      | saved close, else home + close offset| already CLOSE                      |
/// | BLOW       | none, toggles the fan                | never                              |
/// | SMOKE_TEST | none, pulses the smoke machine       | never                              |

use crate::actuators::{FanController, SmokeController};
use crate::axis::{AxisId, Positions};
use crate::config_loader::RuntimeSettings;
use crate::engine::{MotionRequest, MoveReport};
use crate::error::{MotionError, MotionResult};
use crate::position_store::{NamedPosition, PersistedSnapshot, PositionStore};
use crate::profile::{MotionProfile, ProfileKind, Profiles};
use crate::scheduler::{Completion, MovementScheduler, FORCE_WAIT_TIMEOUT};
use crate::state::MotionState;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArmPosition {
    Idle,
    Dip,
    Open,
    Close,
    Home,
    Blow,
    SmokeTest,
}

impl ArmPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArmPosition::Idle => "IDLE",
            ArmPosition::Dip => "DIP",
            ArmPosition::Open => "OPEN",
            ArmPosition::Close => "CLOSE",
            ArmPosition::Home => "HOME",
            ArmPosition::Blow => "BLOW",
            ArmPosition::SmokeTest => "SMOKE_TEST",
        }
    }
}

impl fmt::Display for ArmPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArmPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Ok(ArmPosition::Idle),
            "DIP" => Ok(ArmPosition::Dip),
            "OPEN" => Ok(ArmPosition::Open),
            "CLOSE" => Ok(ArmPosition::Close),
            "HOME" => Ok(ArmPosition::Home),
            "BLOW" => Ok(ArmPosition::Blow),
            "SMOKE_TEST" => Ok(ArmPosition::SmokeTest),
            other => Err(format!("Invalid state '{}'", other)),
        }
    }
}

/// Fixed per-host arm geometry and profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmSettings {
    pub default_dip_offset: Positions,
    pub default_close_offset: Positions,
    pub open_tolerance: u32,
    pub profiles: Profiles,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Wait for (then preempt) an in-flight move instead of being rejected
    pub force: bool,
    /// Block until the move finishes and report its measured duration
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub current_position: ArmPosition,
    pub positions: Positions,
    /// Seconds; the estimate unless the caller waited, 0 when nothing moved
    pub movement_duration: f64,
    pub skipped: bool,
    pub fan_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Snapshot plus the store it is written to. Shared with movement workers so
/// completed moves can record where the axes ended up.
#[derive(Clone)]
struct Persistence {
    store: Arc<dyn PositionStore>,
    snapshot: Arc<Mutex<PersistedSnapshot>>,
}

impl Persistence {
    fn lock(&self) -> MutexGuard<'_, PersistedSnapshot> {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, snapshot: &mut PersistedSnapshot) -> MotionResult<()> {
        snapshot.saved_at = Some(Utc::now());
        self.store.save(snapshot)
    }

    /// Record the axes' current positions; failures only warn.
    fn record_current(&self, positions: Positions) {
        let mut snapshot = self.lock();
        snapshot.current = Some(positions);
        if let Err(e) = self.write(&mut snapshot) {
            log::warn!(target: "arm", "Could not save positions: {}", e);
        }
    }

    fn save_named(&self, name: NamedPosition, positions: Positions) -> MotionResult<PersistedSnapshot> {
        let mut snapshot = self.lock();
        snapshot.set(name, positions);
        snapshot.current = Some(positions);
        self.write(&mut snapshot)?;
        Ok(snapshot.clone())
    }
}

pub struct ArmStateMachine {
    scheduler: Arc<MovementScheduler>,
    persistence: Persistence,
    fan: FanController,
    smoke: Arc<SmokeController>,
    settings: ArmSettings,
    runtime: Mutex<RuntimeSettings>,
}

impl ArmStateMachine {
    pub fn new(
        scheduler: Arc<MovementScheduler>,
        store: Arc<dyn PositionStore>,
        snapshot: PersistedSnapshot,
        fan: FanController,
        smoke: Arc<SmokeController>,
        settings: ArmSettings,
        runtime: RuntimeSettings,
    ) -> Self {
        Self {
            scheduler,
            persistence: Persistence { store, snapshot: Arc::new(Mutex::new(snapshot)) },
            fan,
            smoke,
            settings,
            runtime: Mutex::new(runtime),
        }
    }

    fn state(&self) -> &Arc<MotionState> {
        self.scheduler.engine().state()
    }

    pub fn scheduler(&self) -> &Arc<MovementScheduler> {
        &self.scheduler
    }

    pub fn fan(&self) -> &FanController {
        &self.fan
    }

    pub fn runtime(&self) -> RuntimeSettings {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> PersistedSnapshot {
        self.persistence.lock().clone()
    }

    pub fn positions(&self) -> Positions {
        self.state().positions()
    }

    fn home_target(&self) -> Positions {
        self.persistence.lock().home.unwrap_or(Positions::ORIGIN)
    }

    /// Target for a named position: saved value, else home plus the default
    /// offset.
    pub fn target_for(&self, name: NamedPosition) -> Positions {
        let snapshot = self.persistence.lock();
        let home = snapshot.home.unwrap_or(Positions::ORIGIN);
        match name {
            NamedPosition::Home => home,
            NamedPosition::Dip => snapshot.dip.unwrap_or_else(|| home.offset(self.settings.default_dip_offset)),
            NamedPosition::Close => snapshot.close.unwrap_or_else(|| home.offset(self.settings.default_close_offset)),
        }
    }

    fn result(&self, success: bool, duration: Duration, skipped: bool, message: Option<String>) -> CommandResult {
        CommandResult {
            success,
            current_position: self.state().arm_position(),
            positions: self.positions(),
            movement_duration: duration.as_secs_f64(),
            skipped,
            fan_running: self.fan.is_running(),
            message,
        }
    }

    /// Current state as a command result, reporting the last move's duration.
    pub fn status(&self) -> CommandResult {
        let last_error = self.state().last_error();
        self.result(true, self.state().last_duration(), false, last_error)
    }

    pub fn handle(&self, command: ArmPosition, options: CommandOptions) -> MotionResult<CommandResult> {
        log::info!(target: "arm", "Command {} (force={}, wait={})", command, options.force, options.wait);

        match command {
            ArmPosition::Idle => {
                self.stop_everything();
                self.state().set_arm_position(ArmPosition::Idle);
                Ok(self.result(true, Duration::ZERO, false, None))
            }
            ArmPosition::Dip => {
                let target = self.target_for(NamedPosition::Dip);
                self.move_to(command, target, ProfileKind::TowardDip, options, |current, _| current == ArmPosition::Dip)
            }
            ArmPosition::Open => {
                let home = self.home_target();
                let tolerance = self.settings.open_tolerance;
                self.move_to(command, home, ProfileKind::TowardHome, options, |current, at| {
                    current == ArmPosition::Open && at.within(home, tolerance)
                })
            }
            ArmPosition::Home => {
                let home = self.home_target();
                let forced = CommandOptions { force: true, ..options };
                self.move_to(command, home, ProfileKind::TowardHome, forced, |_, _| false)
            }
            ArmPosition::Close => {
                if let Err(e) = self.fan.stop() {
                    log::warn!(target: "arm", "Fan stop on CLOSE failed: {}", e);
                }
                let target = self.target_for(NamedPosition::Close);
                self.move_to(command, target, ProfileKind::TowardClose, options, |current, _| current == ArmPosition::Close)
            }
            ArmPosition::Blow => self.blow(),
            ArmPosition::SmokeTest => self.smoke_test(),
        }
    }

    fn skipped(&self) -> CommandResult {
        log::info!(target: "arm", "Already at {}; skipped", self.state().arm_position());
        self.result(true, Duration::ZERO, true, None)
    }

    fn move_to(
        &self,
        command: ArmPosition,
        target: Positions,
        kind: ProfileKind,
        options: CommandOptions,
        already_there: impl FnOnce(ArmPosition, Positions) -> bool,
    ) -> MotionResult<CommandResult> {
        let profile = self.settings.profiles.get(kind);
        // Claimed before the move finishes so a repeated command is a no-op
        let Some(previous) = self.state().claim_arm_position(command, already_there) else {
            return Ok(self.skipped());
        };
        self.submit(MotionRequest::new(target, profile), options, command, previous)
    }

    /// Raw absolute move. Leaves the named state machine at IDLE.
    pub fn submit_move(
        &self,
        target: Positions,
        kind: ProfileKind,
        options: CommandOptions,
    ) -> MotionResult<CommandResult> {
        let profile = self.settings.profiles.get(kind);
        let previous = self.state().set_arm_position(ArmPosition::Idle);
        self.submit(MotionRequest::new(target, profile), options, ArmPosition::Idle, previous)
    }

    fn submit(
        &self,
        request: MotionRequest,
        options: CommandOptions,
        claimed: ArmPosition,
        previous: ArmPosition,
    ) -> MotionResult<CommandResult> {
        let persistence = self.persistence.clone();
        let on_done: Completion = Box::new(move |result: &MotionResult<MoveReport>| {
            if let Ok(report) = result {
                persistence.record_current(report.final_positions);
            }
        });

        match self.scheduler.submit_with(request, options.force, Some(on_done)) {
            Ok(estimate) => {
                if !options.wait {
                    return Ok(self.result(true, estimate, false, None));
                }
                let timeout = estimate.mul_f64(4.0) + FORCE_WAIT_TIMEOUT;
                if !self.scheduler.wait_idle(timeout) {
                    log::warn!(target: "arm", "Move still running after {:?}", timeout);
                    return Ok(self.result(true, estimate, false, Some("still moving".to_string())));
                }
                match self.state().last_error() {
                    Some(fault) => Err(MotionError::HardwareFault(fault)),
                    None => Ok(self.result(true, self.state().last_duration(), false, None)),
                }
            }
            Err(MotionError::RejectedBusy) => {
                self.state().release_arm_position(claimed, previous);
                Ok(self.result(false, Duration::ZERO, false, Some(MotionError::RejectedBusy.to_string())))
            }
            Err(e) => {
                self.state().release_arm_position(claimed, previous);
                Err(e)
            }
        }
    }

    fn blow(&self) -> MotionResult<CommandResult> {
        let runtime = self.runtime();
        if !runtime.fan_enabled {
            return Ok(self.result(true, Duration::ZERO, false, Some("fan disabled".to_string())));
        }
        let running = self
            .fan
            .toggle(runtime.fan_speed, runtime.blow_auto_stop())
            .map_err(|e| MotionError::HardwareFault(format!("fan: {}", e)))?;
        log::info!(target: "arm", "BLOW: fan {}", if running { "on" } else { "off" });
        Ok(self.result(true, Duration::ZERO, false, None))
    }

    fn smoke_test(&self) -> MotionResult<CommandResult> {
        let runtime = self.runtime();
        let duration = Duration::from_secs_f64(runtime.smoke_duration.max(0.0));
        self.smoke
            .pulse(runtime.smoke_intensity, duration)
            .map_err(|e| MotionError::HardwareFault(format!("smoke: {}", e)))?;
        Ok(self.result(true, Duration::ZERO, false, None))
    }

    fn stop_everything(&self) {
        if let Some(Ok(report)) = self.scheduler.stop_jog() {
            self.persistence.record_current(report.final_positions);
        }
        if !self.scheduler.engine().release_outputs() {
            log::debug!(target: "arm", "Step lines held by a running move; not released");
        }
        if let Err(e) = self.fan.stop() {
            log::warn!(target: "arm", "Fan stop failed: {}", e);
        }
        self.smoke.stop();
    }

    /// Save the current axis positions under `name`.
    pub fn save_current_as(&self, name: NamedPosition) -> MotionResult<PersistedSnapshot> {
        let positions = self.positions();
        let snapshot = self.persistence.save_named(name, positions)?;
        log::info!(target: "arm", "Saved {} = {}", name, positions);
        Ok(snapshot)
    }

    /// Calibrate both axes to zero. Rejected while anything is moving; the
    /// scheduler slot stays held until the counters are zeroed.
    pub fn reset_to_home(&self) -> MotionResult<CommandResult> {
        self.scheduler.run_when_idle(|| {
            self.state().calibrate();
            self.state().set_arm_position(ArmPosition::Home);
        })?;
        self.persistence.record_current(Positions::ORIGIN);
        log::info!(target: "arm", "Axes recalibrated to home");
        Ok(self.result(true, Duration::ZERO, false, None))
    }

    pub fn set_axis_enabled(&self, axis: AxisId, enabled: bool) -> CommandResult {
        self.state().set_axis_enabled(axis, enabled);
        log::info!(target: "arm", "Axis {} {}", axis, if enabled { "enabled" } else { "disabled" });
        self.result(true, Duration::ZERO, false, None)
    }

    /// Start jogging. Jogging leaves the named positions, so the arm drops to
    /// IDLE.
    pub fn jog(&self, axes: Vec<AxisId>, forward: bool) -> MotionResult<CommandResult> {
        let profile: MotionProfile = self.settings.profiles.get(ProfileKind::Jog);
        self.scheduler.start_jog(axes, forward, profile)?;
        self.state().set_arm_position(ArmPosition::Idle);
        Ok(self.result(true, Duration::ZERO, false, None))
    }

    pub fn stop_jog(&self) -> MotionResult<CommandResult> {
        match self.scheduler.stop_jog() {
            Some(Ok(report)) => {
                self.persistence.record_current(report.final_positions);
                Ok(self.result(true, report.elapsed, false, None))
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.result(true, Duration::ZERO, true, Some("not jogging".to_string()))),
        }
    }

    /// Merge runtime setting updates; returns the new settings and the keys
    /// that were ignored.
    pub fn update_settings(&self, update: &serde_json::Value) -> anyhow::Result<(RuntimeSettings, Vec<String>)> {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let ignored = runtime.apply_update(update)?;
        for key in &ignored {
            log::warn!(target: "arm", "Ignoring unknown config key '{}'", key);
        }
        self.fan.set_speed(runtime.fan_speed)?;
        log::info!(target: "arm", "Runtime settings updated: {:?}", *runtime);
        Ok((runtime.clone(), ignored))
    }

    /// Stop motion and actuators and record where the axes ended up.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.stop_everything();
        self.persistence.record_current(self.positions());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::{LoggingFan, LoggingSmoke};
    use crate::engine::MotionEngine;
    use crate::position_store::MemoryPositionStore;
    use crate::stepper::{DirectionPolarity, SimulatedOutputs, StepperOutputs};

    struct Rig {
        arm: ArmStateMachine,
        store: Arc<MemoryPositionStore>,
        fan: LoggingFan,
        smoke: LoggingSmoke,
    }

    fn fast_profiles() -> Profiles {
        let p = MotionProfile::new(Duration::from_micros(1), 10, 10, 1.0);
        Profiles { toward_home: p, toward_dip: p, toward_close: p, jog: p }
    }

    fn rig_with(outputs: Box<dyn StepperOutputs>, snapshot: PersistedSnapshot) -> Rig {
        let state = Arc::new(MotionState::new(snapshot.current.unwrap_or(Positions::ORIGIN)));
        let engine = Arc::new(MotionEngine::new(state, outputs, DirectionPolarity::default()));
        let scheduler = Arc::new(MovementScheduler::new(engine, 10_000));
        let store = Arc::new(MemoryPositionStore::new(snapshot.clone()));
        let fan = LoggingFan::new();
        let smoke = LoggingSmoke::new();
        let settings = ArmSettings {
            default_dip_offset: Positions::new(200, -200),
            default_close_offset: Positions::new(400, -400),
            open_tolerance: 10,
            profiles: fast_profiles(),
        };
        let arm = ArmStateMachine::new(
            scheduler,
            store.clone(),
            snapshot,
            FanController::new(Box::new(fan.clone())),
            Arc::new(SmokeController::new(Box::new(smoke.clone()))),
            settings,
            RuntimeSettings::default(),
        );
        Rig { arm, store, fan, smoke }
    }

    fn calibrated() -> PersistedSnapshot {
        PersistedSnapshot {
            home: Some(Positions::ORIGIN),
            dip: Some(Positions::new(200, -200)),
            close: Some(Positions::new(200, -200)),
            ..PersistedSnapshot::default()
        }
    }

    fn wait() -> CommandOptions {
        CommandOptions { force: false, wait: true }
    }

    #[test]
    fn test_dip_then_dip_again_is_skipped() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let first = rig.arm.handle(ArmPosition::Dip, wait()).unwrap();
        assert!(first.success);
        assert!(!first.skipped);
        assert_eq!(first.positions, Positions::new(200, -200));
        assert_eq!(first.current_position, ArmPosition::Dip);

        let second = rig.arm.handle(ArmPosition::Dip, wait()).unwrap();
        assert!(second.skipped);
        assert_eq!(second.movement_duration, 0.0);
        assert_eq!(rig.store.current().current, Some(Positions::new(200, -200)));
    }

    #[test]
    fn test_concurrent_dip_runs_once() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let barrier = std::sync::Barrier::new(8);
        let results: Vec<CommandResult> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        rig.arm.handle(ArmPosition::Dip, CommandOptions::default()).unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results.iter().filter(|r| !r.skipped).count(), 1);
        assert!(rig.arm.scheduler().wait_idle(Duration::from_secs(5)));
        assert_eq!(rig.arm.positions(), Positions::new(200, -200));
    }

    #[test]
    fn test_close_with_axis_b_disabled() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm.set_axis_enabled(AxisId::B, false);
        let result = rig.arm.handle(ArmPosition::Close, wait()).unwrap();
        assert_eq!(result.positions, Positions::new(200, 0));
        assert_eq!(result.current_position, ArmPosition::Close);
    }

    #[test]
    fn test_uncalibrated_dip_uses_default_offset() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), PersistedSnapshot::default());
        assert_eq!(rig.arm.target_for(NamedPosition::Dip), Positions::new(200, -200));
        assert_eq!(rig.arm.target_for(NamedPosition::Close), Positions::new(400, -400));
    }

    #[test]
    fn test_busy_rejection_restores_previous_position() {
        let mut snapshot = calibrated();
        snapshot.dip = Some(Positions::new(5000, -5000));
        let rig = rig_with(Box::new(SimulatedOutputs::new()), snapshot);
        let slow = MotionProfile::new(Duration::from_micros(200), 0, 0, 1.0);
        rig.arm
            .scheduler()
            .submit(MotionRequest::new(Positions::new(3000, 0), slow), false)
            .unwrap();

        let rejected = rig.arm.handle(ArmPosition::Dip, CommandOptions::default()).unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.movement_duration, 0.0);
        assert_eq!(rejected.current_position, ArmPosition::Idle);
        assert!(rig.arm.scheduler().wait_idle(Duration::from_secs(20)));
        assert_eq!(rig.arm.positions(), Positions::new(3000, 0));
    }

    #[test]
    fn test_home_is_forced_and_never_skipped() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm.handle(ArmPosition::Dip, CommandOptions::default()).unwrap();
        let home = rig.arm.handle(ArmPosition::Home, wait()).unwrap();
        assert!(home.success);
        assert_eq!(home.positions, Positions::ORIGIN);
        let again = rig.arm.handle(ArmPosition::Home, wait()).unwrap();
        assert!(!again.skipped);
    }

    #[test]
    fn test_open_skipped_only_near_home() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm.handle(ArmPosition::Open, wait()).unwrap();
        assert!(rig.arm.handle(ArmPosition::Open, wait()).unwrap().skipped);

        rig.arm.submit_move(Positions::new(50, 0), ProfileKind::Jog, wait()).unwrap();
        rig.arm.state().set_arm_position(ArmPosition::Open);
        let reopened = rig.arm.handle(ArmPosition::Open, wait()).unwrap();
        assert!(!reopened.skipped);
        assert_eq!(reopened.positions, Positions::ORIGIN);
    }

    #[test]
    fn test_blow_toggles_and_close_stops_fan() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let on = rig.arm.handle(ArmPosition::Blow, CommandOptions::default()).unwrap();
        assert!(on.fan_running);
        assert_eq!(on.current_position, ArmPosition::Idle);
        assert_eq!(on.positions, Positions::ORIGIN);

        let closed = rig.arm.handle(ArmPosition::Close, wait()).unwrap();
        assert!(!closed.fan_running);
        assert_eq!(rig.fan.history(), vec![100.0, 0.0]);
    }

    #[test]
    fn test_blow_with_fan_disabled_does_nothing() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm.update_settings(&serde_json::json!({"fanEnabled": false})).unwrap();
        let result = rig.arm.handle(ArmPosition::Blow, CommandOptions::default()).unwrap();
        assert!(!result.fan_running);
        assert!(rig.fan.history().is_empty());
    }

    #[test]
    fn test_fault_keeps_positions_and_reports() {
        let rig = rig_with(Box::new(SimulatedOutputs::failing_after(25)), calibrated());
        let err = rig.arm.handle(ArmPosition::Dip, wait()).unwrap_err();
        assert!(matches!(err, MotionError::HardwareFault(_)));
        assert_eq!(rig.arm.positions(), Positions::ORIGIN);
        assert_eq!(rig.arm.state().arm_position(), ArmPosition::Dip);
        assert!(rig.arm.status().message.is_some());
    }

    #[test]
    fn test_save_current_and_reset_home() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), PersistedSnapshot::default());
        rig.arm.submit_move(Positions::new(120, -80), ProfileKind::TowardDip, wait()).unwrap();
        let saved = rig.arm.save_current_as(NamedPosition::Dip).unwrap();
        assert_eq!(saved.dip, Some(Positions::new(120, -80)));
        assert_eq!(rig.store.current().dip, Some(Positions::new(120, -80)));

        let reset = rig.arm.reset_to_home().unwrap();
        assert_eq!(reset.positions, Positions::ORIGIN);
        assert_eq!(reset.current_position, ArmPosition::Home);
    }

    #[test]
    fn test_reset_home_rejected_while_moving() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let slow = MotionProfile::new(Duration::from_micros(200), 0, 0, 1.0);
        rig.arm
            .scheduler()
            .submit(MotionRequest::new(Positions::new(3000, 0), slow), false)
            .unwrap();
        assert_eq!(rig.arm.reset_to_home().unwrap_err(), MotionError::RejectedBusy);
        assert!(rig.arm.scheduler().wait_idle(Duration::from_secs(20)));
    }

    #[test]
    fn test_invalid_target_restores_position() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let err = rig
            .arm
            .submit_move(Positions::new(20_000, 0), ProfileKind::TowardDip, wait())
            .unwrap_err();
        assert!(matches!(err, MotionError::InvalidTarget(_)));
        assert_eq!(rig.arm.status().current_position, ArmPosition::Idle);
    }

    #[test]
    fn test_smoke_test_pulses_without_motion() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm
            .update_settings(&serde_json::json!({"smokeDuration": 0.05, "smokeIntensity": 120}))
            .unwrap();
        let result = rig.arm.handle(ArmPosition::SmokeTest, CommandOptions::default()).unwrap();
        assert_eq!(result.positions, Positions::ORIGIN);
        rig.arm.handle(ArmPosition::Idle, CommandOptions::default()).unwrap();
        let levels = rig.smoke.levels();
        assert_eq!(levels.first(), Some(&120));
        assert_eq!(levels.last(), Some(&0));
    }

    #[test]
    fn test_jog_and_stop_records_position() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        rig.arm.handle(ArmPosition::Dip, wait()).unwrap();
        rig.arm.jog(vec![AxisId::A], true).unwrap();
        assert_eq!(rig.arm.state().arm_position(), ArmPosition::Idle);
        std::thread::sleep(Duration::from_millis(20));
        let stopped = rig.arm.stop_jog().unwrap();
        assert!(stopped.positions.a > 200);
        assert_eq!(rig.store.current().current, Some(stopped.positions));
        assert!(rig.arm.stop_jog().unwrap().skipped);
    }

    #[test]
    fn test_update_settings_reports_ignored_keys() {
        let rig = rig_with(Box::new(SimulatedOutputs::new()), calibrated());
        let (runtime, ignored) = rig
            .arm
            .update_settings(&serde_json::json!({"blowDuration": 0, "bogus": 1}))
            .unwrap();
        assert_eq!(runtime.blow_duration, 0.0);
        assert_eq!(ignored, vec!["bogus".to_string()]);
        assert_eq!(runtime.blow_auto_stop(), None);
    }

    #[test]
    fn test_command_names_parse() {
        assert_eq!("smoke_test".parse::<ArmPosition>().unwrap(), ArmPosition::SmokeTest);
        assert!("DANCE".parse::<ArmPosition>().is_err());
        assert_eq!(serde_json::to_value(ArmPosition::SmokeTest).unwrap(), "SMOKE_TEST");
    }
}
