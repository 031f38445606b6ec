/// Motion profiles - per-transition timing and the eased delay curve.
///
/// Delays are per half-step: the engine holds the step line high for one
/// delay and low for one delay.

use crate::error::{MotionError, MotionResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Share of the cubic term in the blended ease; the rest is linear.
const CUBIC_WEIGHT: f64 = 0.7;

/// Slowest half-step delay a profile may produce.
pub const MAX_HALF_STEP_DELAY: Duration = Duration::from_secs(10);

/// Blended cubic/linear ease-in over `t` in [0, 1].
fn blend_ease(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    CUBIC_WEIGHT * t * t * t + (1.0 - CUBIC_WEIGHT) * t
}

fn default_factor() -> f64 {
    4.0
}

fn default_multiplier() -> f64 {
    1.0
}

mod micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_micros(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    #[serde(rename = "base_step_delay_us", with = "micros")]
    pub base_step_delay: Duration,
    #[serde(default)]
    pub ramp_up_steps: u32,
    #[serde(default)]
    pub slow_in_steps: u32,
    #[serde(default = "default_multiplier")]
    pub speed_multiplier: f64,
    /// Slow start delay = base * start_factor
    #[serde(default = "default_factor")]
    pub start_factor: f64,
    /// Slow end delay = base * end_factor
    #[serde(default = "default_factor")]
    pub end_factor: f64,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            base_step_delay: Duration::from_millis(1),
            ramp_up_steps: 0,
            slow_in_steps: 0,
            speed_multiplier: 1.0,
            start_factor: default_factor(),
            end_factor: default_factor(),
        }
    }
}

impl MotionProfile {
    pub fn new(base_step_delay: Duration, ramp_up_steps: u32, slow_in_steps: u32, speed_multiplier: f64) -> Self {
        Self {
            base_step_delay,
            ramp_up_steps,
            slow_in_steps,
            speed_multiplier,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> MotionResult<()> {
        if !self.speed_multiplier.is_finite() || self.speed_multiplier <= 0.0 {
            return Err(MotionError::InvalidProfile(format!(
                "speed multiplier must be positive, got {}",
                self.speed_multiplier
            )));
        }
        for (name, factor) in [("start_factor", self.start_factor), ("end_factor", self.end_factor)] {
            if !factor.is_finite() || factor < 1.0 {
                return Err(MotionError::InvalidProfile(format!("{} must be >= 1, got {}", name, factor)));
            }
        }
        let slowest = self.base_step_delay.as_secs_f64() * self.start_factor.max(self.end_factor) / self.speed_multiplier;
        if slowest > MAX_HALF_STEP_DELAY.as_secs_f64() {
            return Err(MotionError::InvalidProfile(format!(
                "slowest half-step delay {:.3}s exceeds {:?}",
                slowest, MAX_HALF_STEP_DELAY
            )));
        }
        Ok(())
    }

    /// Ramp-up and slow-in step counts for a move of `total_steps`.
    ///
    /// Ramp-up wins: slow-in is cut down so the two regions never overlap.
    pub fn regions(&self, total_steps: u32) -> (u32, u32) {
        let ramp = self.ramp_up_steps.min(total_steps);
        let slow = self.slow_in_steps.min(total_steps - ramp);
        (ramp, slow)
    }

    /// Eased half-step delay for `step_index` of a `total_steps` move.
    pub fn effective_delay(&self, step_index: u32, total_steps: u32) -> Duration {
        let base = self.base_step_delay.as_secs_f64();
        let (ramp, slow) = self.regions(total_steps);

        let delay = if step_index < ramp {
            let start = base * self.start_factor;
            let t = step_index as f64 / ramp as f64;
            start - (start - base) * blend_ease(t)
        } else if slow > 0 && step_index >= total_steps - slow {
            let end = base * self.end_factor;
            let t = (step_index + 1 - (total_steps - slow)) as f64 / slow as f64;
            base + (end - base) * blend_ease(t)
        } else {
            base
        };

        // Saturates rather than panicking on out-of-range values
        Duration::try_from_secs_f64((delay / self.speed_multiplier).max(0.0))
            .map_or(MAX_HALF_STEP_DELAY, |d| d.min(MAX_HALF_STEP_DELAY))
    }

    /// Up-front duration estimate handed back to callers at submission.
    pub fn estimate(&self, max_steps: u32) -> Duration {
        let secs = self.base_step_delay.as_secs_f64() * 2.0 * max_steps as f64 / self.speed_multiplier;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Which stored profile a transition uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    TowardHome,
    TowardDip,
    TowardClose,
    Jog,
}

/// The named profile set, one per transition type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profiles {
    pub toward_home: MotionProfile,
    pub toward_dip: MotionProfile,
    pub toward_close: MotionProfile,
    pub jog: MotionProfile,
}

impl Default for Profiles {
    fn default() -> Self {
        let base = Duration::from_millis(1);
        Self {
            // Home always settles in slowly
            toward_home: MotionProfile::new(base, 50, 100, 1.0),
            toward_dip: MotionProfile::new(base, 50, 40, 1.0),
            toward_close: MotionProfile::new(base, 60, 0, 1.0),
            jog: MotionProfile::new(Duration::from_millis(2), 0, 0, 1.0),
        }
    }
}

impl Profiles {
    pub fn get(&self, kind: ProfileKind) -> MotionProfile {
        match kind {
            ProfileKind::TowardHome => self.toward_home,
            ProfileKind::TowardDip => self.toward_dip,
            ProfileKind::TowardClose => self.toward_close,
            ProfileKind::Jog => self.jog,
        }
    }

    pub fn validate(&self) -> MotionResult<()> {
        self.toward_home.validate()?;
        self.toward_dip.validate()?;
        self.toward_close.validate()?;
        self.jog.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn profile(ramp: u32, slow: u32) -> MotionProfile {
        MotionProfile::new(Duration::from_micros(500), ramp, slow, 1.0)
    }

    fn approx(d: Duration, secs: f64) -> bool {
        (d.as_secs_f64() - secs).abs() < 1e-9
    }

    #[test]
    fn test_middle_region_uses_base_delay() {
        let p = profile(10, 10);
        assert!(approx(p.effective_delay(50, 100), 0.0005));
    }

    #[test]
    fn test_ramp_starts_at_slow_start_delay() {
        let p = profile(10, 0);
        let first = p.effective_delay(0, 100);
        assert!(approx(first, 0.002));
        assert!(p.effective_delay(9, 100) > Duration::from_micros(500));
    }

    #[test]
    fn test_slow_in_ends_at_slow_end_delay() {
        let p = profile(0, 10);
        let last = p.effective_delay(99, 100);
        assert!(approx(last, 0.002));
    }

    #[test]
    fn test_speed_multiplier_divides_delay() {
        let mut p = profile(0, 0);
        p.speed_multiplier = 2.0;
        assert!(approx(p.effective_delay(3, 10), 0.00025));
        assert!(approx(p.estimate(100), 0.05));
    }

    #[test]
    fn test_slow_in_truncated_when_move_is_short() {
        let p = profile(30, 30);
        assert_eq!(p.regions(40), (30, 10));
        assert_eq!(p.regions(20), (20, 0));
        assert_eq!(p.regions(0), (0, 0));
    }

    #[test]
    fn test_validate_rejects_bad_multiplier() {
        let mut p = profile(0, 0);
        p.speed_multiplier = 0.0;
        assert!(matches!(p.validate(), Err(MotionError::InvalidProfile(_))));
        p.speed_multiplier = f64::NAN;
        assert!(p.validate().is_err());
        p.speed_multiplier = 1.5;
        p.end_factor = 0.5;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_huge_factor_rejected_and_clamped() {
        let mut p = profile(10, 10);
        p.start_factor = 1e30;
        assert!(matches!(p.validate(), Err(MotionError::InvalidProfile(_))));
        assert_eq!(p.effective_delay(0, 100), MAX_HALF_STEP_DELAY);

        let mut p = profile(0, 0);
        p.speed_multiplier = 1e-300;
        assert!(p.validate().is_err());
        assert_eq!(p.effective_delay(5, 10), MAX_HALF_STEP_DELAY);
        assert_eq!(p.estimate(10), Duration::MAX);
    }

    #[test]
    fn test_profile_yaml_uses_microseconds() {
        let p: MotionProfile = serde_yaml::from_str("base_step_delay_us: 800\nramp_up_steps: 5\n").unwrap();
        assert_eq!(p.base_step_delay, Duration::from_micros(800));
        assert_eq!(p.ramp_up_steps, 5);
        assert_eq!(p.slow_in_steps, 0);
        assert_eq!(p.speed_multiplier, 1.0);
    }

    proptest! {
        #[test]
        fn prop_regions_never_overlap(ramp in 0u32..500, slow in 0u32..500, total in 0u32..1000) {
            let (r, s) = profile(ramp, slow).regions(total);
            prop_assert!(r + s <= total);
            prop_assert_eq!(r, ramp.min(total));
        }

        #[test]
        fn prop_delay_monotonic_in_eased_regions(ramp in 1u32..200, slow in 1u32..200, total in 1u32..600) {
            let p = profile(ramp, slow);
            let (r, s) = p.regions(total);
            for i in 1..r {
                prop_assert!(p.effective_delay(i, total) <= p.effective_delay(i - 1, total));
            }
            for i in (total - s + 1)..total {
                prop_assert!(p.effective_delay(i, total) >= p.effective_delay(i - 1, total));
            }
        }
    }
}
