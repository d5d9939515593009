// src/lib.rs - smokectl: PID temperature controller for a fan-driven smoker
pub mod autotune;
pub mod clock;
pub mod config;
pub mod console;
pub mod controller;
pub mod fan;
pub mod persistence;
pub mod pid;
pub mod probe;
pub mod safety;
pub mod sensors;
pub mod simulator;
pub mod units;

pub use config::{Config, load_config};
pub use controller::{ControlContext, ControlError, ControlSettings, ControlStatus, TickOutcome};
pub use pid::{PidController, PidGains};
