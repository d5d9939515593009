// src/pid.rs - PID controller with clamped output and anti-windup
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    pub fn is_finite(&self) -> bool {
        self.kp.is_finite() && self.ki.is_finite() && self.kd.is_finite()
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self { kp: 1.0, ki: 0.1, kd: 0.01 }
    }
}

#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    setpoint: f64,
    /// Setpoints at or below this value disarm the controller.
    disarm_threshold: f64,

    integral: f64,
    previous_error: f64,

    output_min: f64,
    output_max: f64,
    last_output: f64,
}

impl PidController {
    pub fn new(gains: PidGains, output_min: f64, output_max: f64) -> Self {
        Self {
            gains,
            setpoint: 0.0,
            disarm_threshold: 0.0,
            integral: 0.0,
            previous_error: 0.0,
            output_min,
            output_max,
            last_output: output_min,
        }
    }

    pub fn with_disarm_threshold(mut self, threshold: f64) -> Self {
        self.disarm_threshold = threshold;
        self
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.setpoint = setpoint;
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
        self.clamp_integral();
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn output_limits(&self) -> (f64, f64) {
        (self.output_min, self.output_max)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn disarm_threshold(&self) -> f64 {
        self.disarm_threshold
    }

    /// True when the setpoint asks for active control.
    pub fn is_armed(&self) -> bool {
        self.setpoint > self.disarm_threshold
    }

    /// Calculate the clamped output for one tick.
    pub fn compute(&mut self, current_value: f64, dt: Duration) -> f64 {
        if !self.is_armed() {
            self.last_output = self.output_min;
            return self.output_min;
        }

        let dt = dt.as_secs_f64();
        let error = self.setpoint - current_value;

        let integral_step = error * dt;
        self.integral += integral_step;
        let derivative = if dt > 0.0 {
            (error - self.previous_error) / dt
        } else {
            0.0
        };

        let raw_output =
            self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        let output = raw_output.clamp(self.output_min, self.output_max);

        // Saturated: undo this tick's integration so the accumulator can't wind up.
        if output != raw_output {
            self.integral -= integral_step;
        }
        self.clamp_integral();

        self.previous_error = error;
        self.last_output = output;
        output
    }

    /// Reset PID state (integral and derivative history).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
    }

    // Keep ki * integral inside the output range.
    fn clamp_integral(&mut self) {
        if self.gains.ki > 0.0 {
            let lo = self.output_min / self.gains.ki;
            let hi = self.output_max / self.gains.ki;
            self.integral = self.integral.clamp(lo.min(hi), lo.max(hi));
        }
    }
}
