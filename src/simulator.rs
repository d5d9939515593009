// src/simulator.rs - Simulated smoker: thermal plant, probes and fan
//
// A first-order plant: airflow from the fan feeds the fire, the enclosure
// loses heat to ambient in proportion to the temperature difference.
//
//   dT/dt = heat_rate * fan_fraction - loss_coefficient * (T - ambient)
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::config::{MAX_SENSOR_NOISE, MAX_TIME_SCALE, SimulationConfig};
use crate::fan::{ActuationError, ActuatorLevel, FanDriver};
use crate::probe::{ProbeError, TemperatureProbe};

#[derive(Debug, Clone)]
pub struct ThermalPlant {
    pub temperature: f64,
    pub ambient: f64,
    pub heat_rate: f64,
    pub loss_coefficient: f64,
    pub fan_fraction: f64,
}

impl ThermalPlant {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            temperature: config.ambient,
            ambient: config.ambient,
            heat_rate: config.heat_rate,
            loss_coefficient: config.loss_coefficient,
            fan_fraction: 0.0,
        }
    }

    /// Integrate `dt` simulated seconds in one-second steps.
    pub fn advance(&mut self, dt: f64) {
        let mut remaining = dt.max(0.0);
        while remaining > 0.0 {
            let step = remaining.min(1.0);
            let heat_gain = self.heat_rate * self.fan_fraction * step;
            let heat_loss = self.loss_coefficient * (self.temperature - self.ambient) * step;
            self.temperature += heat_gain - heat_loss;
            remaining -= step;
        }
    }

    /// Steady-state temperature at the current fan level.
    pub fn equilibrium(&self) -> f64 {
        if self.loss_coefficient <= 0.0 {
            return f64::INFINITY;
        }
        self.ambient + self.heat_rate * self.fan_fraction / self.loss_coefficient
    }
}

struct SimState {
    plant: ThermalPlant,
    last_update: Instant,
}

/// Shared plant driven in real time, scaled by `time_scale`.
#[derive(Clone)]
pub struct Simulation {
    state: Arc<Mutex<SimState>>,
    time_scale: f64,
    noise: f64,
}

impl Simulation {
    pub fn new(config: &SimulationConfig) -> Self {
        tracing::info!(
            "Simulator initialized: ambient {:.1}°C, heat rate {:.2}°C/s, time scale x{}",
            config.ambient,
            config.heat_rate,
            config.time_scale
        );
        Self {
            state: Arc::new(Mutex::new(SimState {
                plant: ThermalPlant::new(config),
                last_update: Instant::now(),
            })),
            time_scale: sanitize(config.time_scale, 1.0).clamp(f64::MIN_POSITIVE, MAX_TIME_SCALE),
            noise: sanitize(config.sensor_noise.abs(), 0.0).min(MAX_SENSOR_NOISE),
        }
    }

    /// Probe that reads the plant with a fixed `bias` plus configured noise.
    pub fn probe(&self, bias: f64) -> SimulatedProbe {
        SimulatedProbe {
            sim: self.clone(),
            bias,
        }
    }

    pub fn fan(&self) -> SimulatedFan {
        SimulatedFan { sim: self.clone() }
    }

    pub fn temperature(&self) -> f64 {
        self.synced().plant.temperature
    }

    pub fn plant(&self) -> ThermalPlant {
        self.synced().plant.clone()
    }

    fn synced(&self) -> MutexGuard<'_, SimState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_update).as_secs_f64();
        // Bound the catch-up after a long stall to one simulated hour.
        state.plant.advance((elapsed * self.time_scale).min(3600.0));
        state.last_update = now;
        state
    }

    fn noise_sample(&self) -> f64 {
        if self.noise <= 0.0 {
            return 0.0;
        }
        rand::rng().random_range(-self.noise..=self.noise)
    }
}

fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}

pub struct SimulatedProbe {
    sim: Simulation,
    bias: f64,
}

#[async_trait]
impl TemperatureProbe for SimulatedProbe {
    async fn read(&self) -> Result<f64, ProbeError> {
        Ok(self.sim.temperature() + self.bias + self.sim.noise_sample())
    }
}

pub struct SimulatedFan {
    sim: Simulation,
}

impl FanDriver for SimulatedFan {
    fn apply(&mut self, level: ActuatorLevel) -> Result<(), ActuationError> {
        self.sim.synced().plant.fan_fraction = level.fraction();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SimulationConfig {
        SimulationConfig {
            ambient: 20.0,
            heat_rate: 2.0,
            loss_coefficient: 0.01,
            sensor_noise: 0.0,
            time_scale: 1.0,
        }
    }

    #[test]
    fn test_plant_heats_with_fan_and_cools_without() {
        let mut plant = ThermalPlant::new(&config());
        plant.fan_fraction = 1.0;
        plant.advance(60.0);
        let hot = plant.temperature;
        assert!(hot > 100.0, "expected heating, got {}", hot);
        assert!(hot < plant.equilibrium());

        plant.fan_fraction = 0.0;
        plant.advance(60.0);
        assert!(plant.temperature < hot);
        assert!(plant.temperature > plant.ambient);
    }

    #[test]
    fn test_plant_idle_stays_at_ambient() {
        let mut plant = ThermalPlant::new(&config());
        plant.advance(3600.0);
        assert!((plant.temperature - 20.0).abs() < 1e-9);
        assert_eq!(plant.equilibrium(), 20.0);
    }

    #[tokio::test]
    async fn test_probe_reports_plant_with_bias() {
        let sim = Simulation::new(&config());
        let probe = sim.probe(1.5);
        let reading = probe.read().await.unwrap();
        assert!((reading - 21.5).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_unchecked_noise_does_not_panic() {
        let mut config = config();
        config.sensor_noise = f64::NAN;
        config.time_scale = f64::INFINITY;
        let sim = Simulation::new(&config);
        let reading = sim.probe(0.0).read().await.unwrap();
        assert!(reading.is_finite());
    }

    #[test]
    fn test_fan_driver_sets_plant_airflow() {
        let sim = Simulation::new(&config());
        let mut fan = sim.fan();
        fan.apply(ActuatorLevel::Duty(0.25)).unwrap();
        assert_eq!(sim.plant().fan_fraction, 0.25);
        fan.apply(ActuatorLevel::Switched(true)).unwrap();
        assert_eq!(sim.plant().fan_fraction, 1.0);
    }
}
