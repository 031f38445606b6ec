use thiserror::Error;

/// Faults raised by the motion core.
///
/// None of these are process-fatal: every variant leaves the axes at their
/// last known position and is reported upward to the command layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MotionError {
    /// A non-forced move was submitted while another one is in flight
    #[error("movement already in flight")]
    RejectedBusy,
    /// An output write failed mid-move; the move was aborted without commit
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    /// Target outside the travel limit or otherwise unusable
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// Profile with a non-positive multiplier or bad easing factors
    #[error("invalid motion profile: {0}")]
    InvalidProfile(String),
    /// Position snapshot could not be loaded or saved
    #[error("persistence fault: {0}")]
    PersistenceFault(String),
}

pub type MotionResult<T> = std::result::Result<T, MotionError>;
