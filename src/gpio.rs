/// GPIO Board module - step/direction and fan output lines over libgpiod.
///
/// All pin numbers come from bubblebot.yaml via config_loader. When GPIO is
/// disabled for the host (or the `gpiod` feature is not compiled in) the
/// daemon falls back to `SimulatedOutputs`.

use crate::axis::AxisId;
use crate::config_loader::{HostSettings, PinMap};
use crate::stepper::{SimulatedOutputs, StepperOutputs};
use anyhow::{anyhow, Result};

#[cfg(feature = "gpiod")]
use gpiocdev::chip::Chip;
#[cfg(feature = "gpiod")]
use gpiocdev::line::Value;
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;

const CONSUMER: &str = "bubblebot";

/// A single requested output line, driven low on request.
#[derive(Debug)]
pub struct OutputLine {
    offset: u32,
    #[cfg(feature = "gpiod")]
    request: Request,
}

impl OutputLine {
    #[cfg(feature = "gpiod")]
    pub fn request(chip_path: &str, offset: u32) -> Result<Self> {
        let request = Request::builder()
            .on_chip(chip_path)
            .with_consumer(CONSUMER)
            .with_line(offset)
            .as_output(Value::Inactive)
            .request()
            .map_err(|e| anyhow!("Failed to request GPIO line {} on {}: {}", offset, chip_path, e))?;
        Ok(Self { offset, request })
    }

    #[cfg(not(feature = "gpiod"))]
    pub fn request(_chip_path: &str, offset: u32) -> Result<Self> {
        Err(anyhow!("GPIO support not compiled in (line {}). Enable 'gpiod' feature.", offset))
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[cfg(feature = "gpiod")]
    pub fn set(&self, high: bool) -> Result<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.request
            .set_value(self.offset, value)
            .map_err(|e| anyhow!("GPIO line {} write failed: {}", self.offset, e))?;
        Ok(())
    }

    #[cfg(not(feature = "gpiod"))]
    pub fn set(&self, _high: bool) -> Result<()> {
        Err(anyhow!("GPIO support not compiled in"))
    }
}

/// Step and direction lines for both arm steppers.
#[derive(Debug)]
pub struct GpioBoard {
    chip_path: String,
    step: [OutputLine; 2],
    dir: [OutputLine; 2],
}

impl GpioBoard {
    /// Request the four motor lines described by `settings`.
    pub fn new(settings: &HostSettings) -> Result<Self> {
        let pins = &settings.pins;
        let chip_path = match &settings.gpio_chip {
            Some(path) => path.clone(),
            None => Self::find_gpio_chip(&required_pins(pins))?,
        };

        let board = Self {
            step: [
                OutputLine::request(&chip_path, pins.step_a)?,
                OutputLine::request(&chip_path, pins.step_b)?,
            ],
            dir: [
                OutputLine::request(&chip_path, pins.dir_a)?,
                OutputLine::request(&chip_path, pins.dir_b)?,
            ],
            chip_path,
        };
        log::info!(target: "gpio", "Motor lines requested on {} (step A={} B={}, dir A={} B={})",
                   board.chip_path, pins.step_a, pins.step_b, pins.dir_a, pins.dir_b);
        Ok(board)
    }

    pub fn chip_path(&self) -> &str {
        &self.chip_path
    }

    /// Find a gpiochip that exposes all required pins
    #[cfg(feature = "gpiod")]
    pub fn find_gpio_chip(required: &[u32]) -> Result<String> {
        use std::fs;

        let mut chip_paths: Vec<String> = fs::read_dir("/dev")?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let path = entry.path();
                let name = path.file_name()?.to_str()?;
                if name.starts_with("gpiochip") {
                    Some(path.to_string_lossy().to_string())
                } else {
                    None
                }
            })
            .collect();
        chip_paths.sort();

        for chip_path in &chip_paths {
            if let Ok(chip) = Chip::from_path(chip_path) {
                if required.iter().all(|pin| chip.line_info(*pin).is_ok()) {
                    return Ok(chip_path.clone());
                }
            }
        }

        chip_paths
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("No usable gpiochip device found"))
    }

    #[cfg(not(feature = "gpiod"))]
    pub fn find_gpio_chip(_required: &[u32]) -> Result<String> {
        Err(anyhow!("GPIO support not compiled in"))
    }
}

impl StepperOutputs for GpioBoard {
    fn set_direction(&mut self, axis: AxisId, high: bool) -> Result<()> {
        self.dir[axis.index()].set(high)
    }

    fn set_step(&mut self, axis: AxisId, high: bool) -> Result<()> {
        self.step[axis.index()].set(high)
    }
}

fn required_pins(pins: &PinMap) -> Vec<u32> {
    let mut all = vec![pins.step_a, pins.dir_a, pins.step_b, pins.dir_b];
    all.extend(pins.fan_pwm);
    all
}

/// Pick the motor output backend for this host.
///
/// Returns the chip path alongside the outputs so the fan can share it;
/// `None` means the simulated backend is in use.
pub fn open_stepper_outputs(settings: &HostSettings, simulate: bool) -> Result<(Box<dyn StepperOutputs>, Option<String>)> {
    if simulate || !settings.gpio_enabled {
        log::warn!(target: "gpio", "GPIO disabled for this host; using simulated step outputs");
        return Ok((Box::new(SimulatedOutputs::new()), None));
    }
    let board = GpioBoard::new(settings)?;
    let chip = board.chip_path().to_string();
    Ok((Box::new(board), Some(chip)))
}
