/// BubbleBot Library
///
/// Motion coordination for the two-axis bubble arm plus the fan, smoke and
/// command-server collaborators the daemon binds together.

pub mod actuators;
pub mod arm;
pub mod axis;
pub mod command_server;
pub mod config_loader;
pub mod dmx;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod machine;
pub mod position_store;
pub mod profile;
pub mod scheduler;
pub mod state;
pub mod stepper;

pub use error::{MotionError, MotionResult};
