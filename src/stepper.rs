/// Step/direction output seam between the motion engine and the hardware.
///
/// `GpioBoard` drives real lines through libgpiod; `SimulatedOutputs` is used
/// on hosts without GPIO and by the tests.

use crate::axis::AxisId;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};

/// Trait for step/direction outputs - lets the engine run against different backends
pub trait StepperOutputs: Send {
    fn set_direction(&mut self, axis: AxisId, high: bool) -> Result<()>;
    fn set_step(&mut self, axis: AxisId, high: bool) -> Result<()>;
}

/// Per-axis direction polarity. The two motors face each other, so axis B's
/// sense is normally inverted relative to axis A.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectionPolarity {
    pub invert_a: bool,
    pub invert_b: bool,
}

impl Default for DirectionPolarity {
    fn default() -> Self {
        Self { invert_a: false, invert_b: true }
    }
}

impl DirectionPolarity {
    /// Direction line level for a move of `axis` toward increasing positions
    /// (`forward = true`) or decreasing positions.
    pub fn level(&self, axis: AxisId, forward: bool) -> bool {
        let invert = match axis {
            AxisId::A => self.invert_a,
            AxisId::B => self.invert_b,
        };
        forward != invert
    }
}

#[derive(Debug, Default, Clone)]
pub struct SimLog {
    /// Rising edges seen per axis
    pub pulses: [u32; 2],
    pub direction: [Option<bool>; 2],
    pub step_level: [bool; 2],
    /// Total output writes so far
    pub writes: u64,
    /// Fail every write once `writes` reaches this count
    pub fail_after: Option<u64>,
}

/// In-memory outputs that count pulses. Clones share the same log so a test
/// can keep a handle after boxing one into the engine.
#[derive(Debug, Default, Clone)]
pub struct SimulatedOutputs {
    log: Arc<Mutex<SimLog>>,
}

impl SimulatedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs that start failing after `writes` successful writes.
    pub fn failing_after(writes: u64) -> Self {
        let sim = Self::default();
        sim.lock().fail_after = Some(writes);
        sim
    }

    fn lock(&self) -> MutexGuard<'_, SimLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SimLog {
        self.lock().clone()
    }

    pub fn pulses(&self, axis: AxisId) -> u32 {
        self.lock().pulses[axis.index()]
    }

    fn record(&self, apply: impl FnOnce(&mut SimLog)) -> Result<()> {
        let mut log = self.lock();
        if let Some(limit) = log.fail_after {
            if log.writes >= limit {
                return Err(anyhow!("simulated output fault after {} writes", limit));
            }
        }
        log.writes += 1;
        apply(&mut log);
        Ok(())
    }
}

impl StepperOutputs for SimulatedOutputs {
    fn set_direction(&mut self, axis: AxisId, high: bool) -> Result<()> {
        self.record(|log| log.direction[axis.index()] = Some(high))
    }

    fn set_step(&mut self, axis: AxisId, high: bool) -> Result<()> {
        self.record(|log| {
            let i = axis.index();
            if high && !log.step_level[i] {
                log.pulses[i] += 1;
            }
            log.step_level[i] = high;
        })
    }
}
