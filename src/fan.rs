// src/fan.rs - Fan actuator: maps controller output to a fan level
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The output hardware refused the level. Nothing else in the loop is fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActuationError {
    #[error("fan output failed: {0}")]
    Output(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FanMode {
    /// On below the setpoint, off otherwise.
    #[default]
    Binary,
    /// Duty cycle scaled from the PID output.
    Proportional,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorLevel {
    Switched(bool),
    Duty(f64),
}

impl ActuatorLevel {
    pub fn off(mode: FanMode) -> Self {
        match mode {
            FanMode::Binary => ActuatorLevel::Switched(false),
            FanMode::Proportional => ActuatorLevel::Duty(0.0),
        }
    }

    pub fn is_on(&self) -> bool {
        match *self {
            ActuatorLevel::Switched(on) => on,
            ActuatorLevel::Duty(duty) => duty > 0.0,
        }
    }

    /// Level as a fraction of full power.
    pub fn fraction(&self) -> f64 {
        match *self {
            ActuatorLevel::Switched(on) => {
                if on {
                    1.0
                } else {
                    0.0
                }
            }
            ActuatorLevel::Duty(duty) => duty,
        }
    }
}

/// The physical output (relay GPIO, PWM channel, simulated plant).
pub trait FanDriver: Send {
    fn apply(&mut self, level: ActuatorLevel) -> Result<(), ActuationError>;
}

pub struct FanActuator {
    mode: FanMode,
    level: ActuatorLevel,
    target_temperature: f64,
    disarm_threshold: f64,
    output_min: f64,
    output_max: f64,
    driver: Box<dyn FanDriver>,
}

impl std::fmt::Debug for FanActuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanActuator")
            .field("mode", &self.mode)
            .field("level", &self.level)
            .field("target_temperature", &self.target_temperature)
            .finish()
    }
}

impl FanActuator {
    pub fn new(mode: FanMode, driver: Box<dyn FanDriver>) -> Self {
        Self {
            mode,
            level: ActuatorLevel::off(mode),
            target_temperature: 0.0,
            disarm_threshold: 0.0,
            output_min: 0.0,
            output_max: 100.0,
            driver,
        }
    }

    /// PID output range used to scale proportional duty.
    pub fn with_output_range(mut self, min: f64, max: f64) -> Self {
        self.output_min = min;
        self.output_max = max;
        self
    }

    pub fn with_disarm_threshold(mut self, threshold: f64) -> Self {
        self.disarm_threshold = threshold;
        self
    }

    /// Map one tick of controller state onto the fan.
    pub fn update(
        &mut self,
        pid_output: f64,
        setpoint: f64,
        current_value: f64,
    ) -> Result<ActuatorLevel, ActuationError> {
        self.target_temperature = setpoint;
        let armed = setpoint > self.disarm_threshold;
        let level = match self.mode {
            FanMode::Binary => ActuatorLevel::Switched(armed && current_value < setpoint),
            FanMode::Proportional => {
                if armed {
                    let span = self.output_max - self.output_min;
                    let duty = if span > 0.0 {
                        (pid_output - self.output_min) / span
                    } else {
                        0.0
                    };
                    ActuatorLevel::Duty(duty.clamp(0.0, 1.0))
                } else {
                    ActuatorLevel::Duty(0.0)
                }
            }
        };
        self.set_level(level)?;
        Ok(level)
    }

    /// Full on or fully off, regardless of mode.
    pub fn drive_relay(&mut self, on: bool) -> Result<ActuatorLevel, ActuationError> {
        let level = match self.mode {
            FanMode::Binary => ActuatorLevel::Switched(on),
            FanMode::Proportional => ActuatorLevel::Duty(if on { 1.0 } else { 0.0 }),
        };
        self.set_level(level)?;
        Ok(level)
    }

    /// Unconditionally drive the fan to its minimum.
    pub fn force_off(&mut self) -> Result<(), ActuationError> {
        self.set_level(ActuatorLevel::off(self.mode))
    }

    pub fn is_on(&self) -> bool {
        self.level.is_on()
    }

    pub fn level(&self) -> ActuatorLevel {
        self.level
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_temperature
    }

    fn set_level(&mut self, level: ActuatorLevel) -> Result<(), ActuationError> {
        if level != self.level {
            tracing::debug!("Fan level {:?} -> {:?}", self.level, level);
        }
        match self.driver.apply(level) {
            Ok(()) => {
                self.level = level;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Fan driver rejected level {:?}: {}", level, e);
                Err(e)
            }
        }
    }
}
