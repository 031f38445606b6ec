/// Machine assembly - builds the arm state machine and its collaborators
/// from host settings.

use crate::actuators::{FanController, FanDriver, LoggingFan, LoggingSmoke, SmokeController, SmokeDriver, SoftPwmFan};
use crate::arm::{ArmSettings, ArmStateMachine};
use crate::axis::Positions;
use crate::config_loader::HostSettings;
use crate::dmx::DmxSmoke;
use crate::engine::MotionEngine;
use crate::gpio::{open_stepper_outputs, OutputLine};
use crate::position_store::{load_or_default, PositionStore, YamlPositionStore};
use crate::scheduler::MovementScheduler;
use crate::state::MotionState;
use crate::stepper::DirectionPolarity;
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

fn open_fan(settings: &HostSettings, chip: Option<&str>) -> Box<dyn FanDriver> {
    let (Some(chip), Some(pin)) = (chip, settings.pins.fan_pwm) else {
        return Box::new(LoggingFan::new());
    };
    if !settings.runtime.fan_enabled {
        log::info!(target: "machine", "Fan disabled - skipping PWM setup");
        return Box::new(LoggingFan::new());
    }
    match OutputLine::request(chip, pin).and_then(|line| SoftPwmFan::new(line, settings.fan.pwm_hz)) {
        Ok(fan) => Box::new(fan),
        Err(e) => {
            log::error!(target: "machine", "Fan PWM setup failed on pin {}: {:#}; fan commands will only be logged", pin, e);
            Box::new(LoggingFan::new())
        }
    }
}

fn open_smoke(settings: &HostSettings, simulate: bool) -> Box<dyn SmokeDriver> {
    let smoke = &settings.smoke;
    match (&smoke.dmx_port, simulate) {
        (Some(port), false) => match DmxSmoke::open(port, smoke.baud, smoke.dmx_channel) {
            Ok(dmx) => Box::new(dmx),
            Err(e) => {
                log::error!(target: "machine", "{:#}; smoke commands will only be logged", e);
                Box::new(LoggingSmoke::new())
            }
        },
        _ => Box::new(LoggingSmoke::new()),
    }
}

/// Build the full machine for `settings`. `config_path` anchors a relative
/// positions file.
pub fn build_machine(settings: &HostSettings, config_path: &Path, simulate: bool) -> Result<Arc<ArmStateMachine>> {
    let store: Arc<dyn PositionStore> = Arc::new(YamlPositionStore::new(settings.positions_path(config_path)));
    let snapshot = load_or_default(store.as_ref());
    let start = snapshot.current.unwrap_or(Positions::ORIGIN);
    log::info!(target: "machine", "Starting at {} (home={:?}, dip={:?}, close={:?})",
               start, snapshot.home, snapshot.dip, snapshot.close);

    let (outputs, chip) = open_stepper_outputs(settings, simulate)?;
    let polarity = DirectionPolarity {
        invert_a: settings.invert_direction.a,
        invert_b: settings.invert_direction.b,
    };
    let state = Arc::new(MotionState::new(start));
    let engine = Arc::new(MotionEngine::new(state, outputs, polarity));
    let scheduler = Arc::new(MovementScheduler::new(engine, settings.travel_limit));

    let fan = FanController::new(open_fan(settings, chip.as_deref()));
    let smoke = Arc::new(SmokeController::new(open_smoke(settings, simulate)));
    let arm_settings = ArmSettings {
        default_dip_offset: settings.default_dip_offset,
        default_close_offset: settings.default_close_offset,
        open_tolerance: settings.open_tolerance,
        profiles: settings.profiles.clone(),
    };

    Ok(Arc::new(ArmStateMachine::new(
        scheduler,
        store,
        snapshot,
        fan,
        smoke,
        arm_settings,
        settings.runtime.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{ArmPosition, CommandOptions};
    use crate::config_loader::parse_host_settings;

    #[test]
    fn test_simulated_machine_restores_saved_position() {
        let dir = std::env::temp_dir();
        let positions = dir.join(format!("bubblebot_machine_{}.yaml", std::process::id()));
        std::fs::write(&positions, "current: {a: 12, b: -7}\ndip: {a: 40, b: -40}\n").unwrap();
        let yaml = format!(
            "Ubuntu:\n  devbox:\n    TRAVEL_LIMIT: 1000\n    DEFAULT_DIP_OFFSET: {{a: 10, b: -10}}\n    \
             DEFAULT_CLOSE_OFFSET: {{a: 20, b: -20}}\n    POSITIONS_FILE: {}\n    \
             PROFILES:\n      toward_home: {{base_step_delay_us: 1}}\n      toward_dip: {{base_step_delay_us: 1}}\n      \
             toward_close: {{base_step_delay_us: 1}}\n      jog: {{base_step_delay_us: 1}}\n",
            positions.display()
        );
        let settings = parse_host_settings(&yaml, "devbox").unwrap();
        let arm = build_machine(&settings, Path::new("/nonexistent/bubblebot.yaml"), true).unwrap();
        assert_eq!(arm.positions(), Positions::new(12, -7));

        let result = arm.handle(ArmPosition::Dip, CommandOptions { force: false, wait: true }).unwrap();
        assert_eq!(result.positions, Positions::new(40, -40));
        arm.shutdown();
        let saved = std::fs::read_to_string(&positions).unwrap();
        assert!(saved.contains("saved_at"));
        let _ = std::fs::remove_file(&positions);
    }
}
