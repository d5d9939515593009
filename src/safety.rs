// src/safety.rs - Emergency-shutdown interlock
//
// Armed --emergency_shutdown--> Shutdown --operator setpoint > threshold--> Armed
//
// The latch is never cleared by the tick loop.
use serde::Serialize;

use crate::fan::{ActuationError, FanActuator};
use crate::pid::PidController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyState {
    Armed,
    Shutdown,
}

#[derive(Debug)]
pub struct SafetySupervisor {
    state: SafetyState,
    shutdowns: u64,
}

impl SafetySupervisor {
    pub fn new() -> Self {
        Self {
            state: SafetyState::Armed,
            shutdowns: 0,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == SafetyState::Armed
    }

    pub fn is_shutdown(&self) -> bool {
        self.state == SafetyState::Shutdown
    }

    /// Number of times the latch has been engaged since start.
    pub fn shutdown_count(&self) -> u64 {
        self.shutdowns
    }

    /// Disarm the PID, cut the fan and latch.
    ///
    /// The latch is set before the fan is touched, so a driver failure still
    /// leaves the supervisor in `Shutdown`.
    pub fn emergency_shutdown(
        &mut self,
        pid: &mut PidController,
        fan: &mut FanActuator,
    ) -> Result<(), ActuationError> {
        if self.state == SafetyState::Armed {
            tracing::warn!("EMERGENCY SHUTDOWN: latching safety interlock");
            self.shutdowns += 1;
        }
        self.state = SafetyState::Shutdown;
        pid.set_setpoint(0.0);
        pid.reset();
        fan.force_off()
    }

    /// Operator re-arm. Only a setpoint that actually arms the PID clears the latch.
    /// Returns true if the latch was cleared.
    pub fn rearm(&mut self, setpoint: f64, disarm_threshold: f64) -> bool {
        if self.state == SafetyState::Shutdown && setpoint > disarm_threshold {
            tracing::info!("Safety interlock cleared by operator setpoint {:.1}°C", setpoint);
            self.state = SafetyState::Armed;
            return true;
        }
        false
    }

    /// Per-tick enforcement while latched: the fan stays at its minimum.
    pub fn enforce(&self, fan: &mut FanActuator) -> Result<bool, ActuationError> {
        if self.is_shutdown() {
            fan.force_off()?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan::{ActuatorLevel, FanDriver, FanMode};
    use crate::pid::PidGains;

    struct NullDriver;

    impl FanDriver for NullDriver {
        fn apply(&mut self, _level: ActuatorLevel) -> Result<(), ActuationError> {
            Ok(())
        }
    }

    fn parts() -> (PidController, FanActuator) {
        let mut pid = PidController::new(PidGains::new(1.0, 0.0, 0.0), 0.0, 100.0);
        pid.set_setpoint(100.0);
        (pid, FanActuator::new(FanMode::Binary, Box::new(NullDriver)))
    }

    #[test]
    fn test_shutdown_latches_and_cuts_fan() {
        let mut safety = SafetySupervisor::new();
        let (mut pid, mut fan) = parts();
        fan.update(50.0, 100.0, 20.0).unwrap();
        assert!(fan.is_on());

        safety.emergency_shutdown(&mut pid, &mut fan).unwrap();
        assert!(safety.is_shutdown());
        assert!(!fan.is_on());
        assert_eq!(pid.setpoint(), 0.0);
        assert_eq!(safety.shutdown_count(), 1);
    }

    #[test]
    fn test_enforce_overrides_fan_while_latched() {
        let mut safety = SafetySupervisor::new();
        let (mut pid, mut fan) = parts();
        safety.emergency_shutdown(&mut pid, &mut fan).unwrap();
        for _ in 0..10 {
            fan.update(100.0, 100.0, 0.0).unwrap();
            assert!(safety.enforce(&mut fan).unwrap());
            assert!(!fan.is_on());
        }
    }

    #[test]
    fn test_rearm_requires_positive_setpoint() {
        let mut safety = SafetySupervisor::new();
        let (mut pid, mut fan) = parts();
        safety.emergency_shutdown(&mut pid, &mut fan).unwrap();
        assert!(!safety.rearm(0.0, 0.0));
        assert!(!safety.rearm(-5.0, 0.0));
        assert!(safety.is_shutdown());
        assert!(safety.rearm(95.0, 0.0));
        assert!(safety.is_armed());
        // Re-arming an armed supervisor is a no-op.
        assert!(!safety.rearm(95.0, 0.0));
    }
}
