/// Axis module - absolute step counters for the two arm motors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one of the two arm steppers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisId {
    A,
    B,
}

impl AxisId {
    pub const ALL: [AxisId; 2] = [AxisId::A, AxisId::B];

    pub fn index(self) -> usize {
        match self {
            AxisId::A => 0,
            AxisId::B => 1,
        }
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisId::A => write!(f, "A"),
            AxisId::B => write!(f, "B"),
        }
    }
}

impl FromStr for AxisId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(AxisId::A),
            "B" => Ok(AxisId::B),
            other => Err(format!("unknown axis '{}'", other)),
        }
    }
}

/// Absolute position pair, in steps from the home origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Positions {
    pub a: i32,
    pub b: i32,
}

impl Positions {
    pub const ORIGIN: Positions = Positions { a: 0, b: 0 };

    pub fn new(a: i32, b: i32) -> Self {
        Self { a, b }
    }

    pub fn get(&self, axis: AxisId) -> i32 {
        match axis {
            AxisId::A => self.a,
            AxisId::B => self.b,
        }
    }

    pub fn set(&mut self, axis: AxisId, value: i32) {
        match axis {
            AxisId::A => self.a = value,
            AxisId::B => self.b = value,
        }
    }

    pub fn offset(&self, by: Positions) -> Positions {
        Positions::new(self.a.saturating_add(by.a), self.b.saturating_add(by.b))
    }

    /// True when both axes are within `tolerance` steps of `other`
    pub fn within(&self, other: Positions, tolerance: u32) -> bool {
        self.a.abs_diff(other.a) <= tolerance && self.b.abs_diff(other.b) <= tolerance
    }
}

impl fmt::Display for Positions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.a, self.b)
    }
}

/// One stepper's tracked absolute position.
///
/// A disabled axis is skipped by the engine and never changes position
/// through `commit`; only `calibrate` can move its counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Axis {
    position: i32,
    enabled: bool,
}

impl Default for Axis {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Axis {
    pub fn new(position: i32) -> Self {
        Self { position, enabled: true }
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Write a completed move's final position. Returns false (and leaves the
    /// counter alone) when the axis is disabled.
    pub fn commit(&mut self, new_position: i32) -> bool {
        if !self.enabled {
            return false;
        }
        self.position = new_position;
        true
    }

    /// Record a position the motor was physically driven to. Ignores the
    /// enabled flag: the pulses already happened.
    pub fn track(&mut self, new_position: i32) {
        self.position = new_position;
    }

    /// Force the counter to zero (operator recalibration).
    pub fn calibrate(&mut self) {
        self.position = 0;
    }
}
