// src/controller.rs - Control context: periodic tick and operator commands
//
// Two locks: `sensors` is held across probe I/O, `core` only across the
// synchronous compute/actuate step and commands. Probe I/O never runs under
// the core lock, so a stuck probe cannot delay an emergency shutdown.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use crate::autotune::{AutotuneError, AutotuneFailure, AutotuneSettings, AutotuneState, AutotuneSummary, Autotuner};
use crate::clock::Clock;
use crate::config::{Config, ProbeConfig};
use crate::fan::{ActuationError, ActuatorLevel, FanActuator, FanDriver, FanMode};
use crate::persistence::{AGGREGATE_SOURCE, Sample, SampleHistory, SampleSink};
use crate::pid::{PidController, PidGains};
use crate::probe::TemperatureProbe;
use crate::safety::{SafetyState, SafetySupervisor};
use crate::sensors::{AggregationError, ProbeId, ProbeReading, ProbeStatus, RegistrationError, SensorAggregator};
use crate::units::TemperatureUnit;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Actuation error: {0}")]
    Actuation(#[from] ActuationError),
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),
    #[error("Autotune error: {0}")]
    Autotune(#[from] AutotuneError),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
}

/// Everything the context needs from configuration, resolved once.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub device_name: String,
    pub display_unit: TemperatureUnit,
    pub sample_period: Duration,
    pub probe_timeout: Duration,
    pub initial_setpoint: f64,
    pub disarm_threshold: f64,
    pub gains: PidGains,
    pub output_min: f64,
    pub output_max: f64,
    pub fan_mode: FanMode,
    pub autotune: AutotuneSettings,
    pub history_capacity: usize,
}

impl ControlSettings {
    pub fn from_config(config: &Config) -> Self {
        let control = &config.control;
        Self {
            device_name: config.controller.device_name.clone(),
            display_unit: config.controller.display_unit,
            sample_period: control.sample_period(),
            probe_timeout: control.probe_timeout(),
            initial_setpoint: control.setpoint,
            disarm_threshold: control.disarm_threshold,
            gains: control.gains,
            output_min: control.output_min,
            output_max: control.output_max,
            fan_mode: control.fan_mode,
            autotune: AutotuneSettings::from_config(
                &config.autotune,
                control.output_min,
                control.output_max,
                control.disarm_threshold,
            ),
            history_capacity: config.persistence.history_capacity,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Normal PID control.
    Controlled { aggregate: f64, output: f64, level: ActuatorLevel },
    /// No valid readings; fan held off.
    SensorFault(AggregationError),
    /// Autotune owns the fan this tick.
    Autotune { relay_on: bool, state: AutotuneState },
    /// Safety latch engaged; fan forced off.
    Shutdown,
}

/// Full status snapshot. Always complete, even when sensors are faulted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlStatus {
    pub device_name: String,
    pub unit: TemperatureUnit,
    pub aggregate_temperature: Option<f64>,
    pub probes: Vec<ProbeStatus>,
    pub fan_on: bool,
    pub fan_level: f64,
    pub fan_mode: FanMode,
    pub setpoint: f64,
    pub gains: PidGains,
    pub last_output: f64,
    /// Safety interlock state: false once emergency shutdown has latched.
    pub armed: bool,
    /// Setpoint at or below the disarm threshold.
    pub disarmed: bool,
    pub sensor_fault: Option<AggregationError>,
    pub autotune: AutotuneSummary,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl ControlStatus {
    /// A copy with every temperature expressed in `unit`.
    pub fn in_unit(&self, unit: TemperatureUnit) -> ControlStatus {
        let mut status = self.clone();
        status.unit = unit;
        status.aggregate_temperature = self.aggregate_temperature.map(|t| unit.from_celsius(t));
        status.setpoint = unit.from_celsius(self.setpoint);
        for probe in &mut status.probes {
            probe.last_value = probe.last_value.map(|t| unit.from_celsius(t));
            probe.offset = unit.delta_from_celsius(probe.offset);
        }
        status.autotune.target = self.autotune.target.map(|t| unit.from_celsius(t));
        status
    }
}

struct ControlCore {
    pid: PidController,
    fan: FanActuator,
    safety: SafetySupervisor,
    autotune: Autotuner,
    last_tick: Option<Instant>,
    last_tick_at: Option<DateTime<Utc>>,
    aggregate: Option<f64>,
    sensor_fault: Option<AggregationError>,
    probes: Vec<ProbeStatus>,
    ticks: u64,
}

impl ControlCore {
    fn step(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        aggregate: Result<f64, AggregationError>,
        default_dt: Duration,
    ) -> Result<TickOutcome, ControlError> {
        let dt = match self.last_tick {
            Some(previous) => now.saturating_duration_since(previous),
            None => default_dt,
        };
        self.last_tick = Some(now);
        self.last_tick_at = Some(wall);
        self.ticks += 1;

        match aggregate {
            Ok(value) => {
                if self.sensor_fault.take().is_some() {
                    tracing::info!("Valid readings restored ({:.1}°C)", value);
                }
                self.aggregate = Some(value);
            }
            Err(e) => {
                if self.sensor_fault.is_none() {
                    tracing::warn!("Sensor fault: {}; holding fan off", e);
                }
                self.sensor_fault = Some(e);
                self.aggregate = None;
            }
        }

        if self.safety.enforce(&mut self.fan)? {
            return Ok(TickOutcome::Shutdown);
        }

        if self.autotune.is_running() {
            let relay_on = match aggregate {
                Ok(value) => self.autotune.observe(now, value),
                Err(_) => self.autotune.record_fault(now),
            };
            self.fan.drive_relay(relay_on)?;
            let state = self.autotune.state();
            if state != AutotuneState::Running {
                // Hand the fan back to the PID without stale history.
                self.pid.reset();
            }
            return Ok(TickOutcome::Autotune { relay_on, state });
        }

        match aggregate {
            Ok(value) => {
                let output = self.pid.compute(value, dt);
                let level = self.fan.update(output, self.pid.setpoint(), value)?;
                tracing::debug!(
                    "Tick {}: {:.2}°C -> output {:.2}, fan {:?}",
                    self.ticks,
                    value,
                    output,
                    level
                );
                Ok(TickOutcome::Controlled { aggregate: value, output, level })
            }
            Err(e) => {
                self.fan.force_off()?;
                Ok(TickOutcome::SensorFault(e))
            }
        }
    }
}

pub struct ControlContext {
    settings: ControlSettings,
    clock: Arc<dyn Clock>,
    sensors: Mutex<SensorAggregator>,
    core: Mutex<ControlCore>,
    history: Arc<SampleHistory>,
    sinks: Vec<Arc<dyn SampleSink>>,
}

impl ControlContext {
    pub fn new(settings: ControlSettings, fan_driver: Box<dyn FanDriver>, clock: Arc<dyn Clock>) -> Self {
        let mut pid = PidController::new(settings.gains, settings.output_min, settings.output_max)
            .with_disarm_threshold(settings.disarm_threshold);
        pid.set_setpoint(settings.initial_setpoint);
        let fan = FanActuator::new(settings.fan_mode, fan_driver)
            .with_output_range(settings.output_min, settings.output_max)
            .with_disarm_threshold(settings.disarm_threshold);

        Self {
            sensors: Mutex::new(SensorAggregator::new(settings.probe_timeout)),
            core: Mutex::new(ControlCore {
                pid,
                fan,
                safety: SafetySupervisor::new(),
                autotune: Autotuner::new(settings.autotune.clone()),
                last_tick: None,
                last_tick_at: None,
                aggregate: None,
                sensor_fault: None,
                probes: Vec::new(),
                ticks: 0,
            }),
            history: Arc::new(SampleHistory::new(settings.history_capacity)),
            sinks: Vec::new(),
            clock,
            settings,
        }
    }

    /// Add an extra sample sink (e.g. CSV). Must be called before sharing.
    pub fn with_sink(mut self, sink: Arc<dyn SampleSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// One poll -> aggregate -> compute -> actuate cycle.
    ///
    /// Only an actuation failure is returned as an error.
    pub async fn tick(&self) -> Result<TickOutcome, ControlError> {
        let wall = self.clock.now_wallclock();
        let (readings, probes) = {
            let mut sensors = self.sensors.lock().await;
            let readings = sensors.poll(wall).await;
            (readings, sensors.statuses())
        };
        let aggregate = SensorAggregator::aggregate(&readings);
        self.record(wall, &readings, aggregate);

        let now = self.clock.now_monotonic();
        let mut core = self.core.lock().await;
        core.probes = probes;
        core.step(now, wall, aggregate, self.settings.sample_period)
    }

    /// Run the tick at the configured period until `shutdown_rx` fires or
    /// actuation fails. The fan is forced off on the way out.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), ControlError> {
        let mut interval = tokio::time::interval(self.settings.sample_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            "Control loop started: period {} ms, probe timeout {} ms",
            self.settings.sample_period.as_millis(),
            self.settings.probe_timeout.as_millis()
        );

        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Control loop shutting down");
                    break Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("Control loop terminated: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        let mut core = self.core.lock().await;
        if let Err(e) = core.fan.force_off() {
            tracing::error!("Failed to turn fan off on exit: {}", e);
        }
        result
    }

    pub fn spawn(self: &Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<Result<(), ControlError>> {
        tokio::spawn(self.clone().run(shutdown_rx))
    }

    // --- Commands ---

    /// Operator setpoint. A setpoint above the disarm threshold also clears a
    /// latched emergency shutdown.
    pub async fn set_setpoint(&self, value: f64) -> Result<(), ControlError> {
        if !value.is_finite() {
            return Err(ControlError::InvalidCommand(format!("setpoint {} is not finite", value)));
        }
        let mut core = self.core.lock().await;
        core.pid.set_setpoint(value);
        core.safety.rearm(value, self.settings.disarm_threshold);
        tracing::info!("Setting target temperature: {:.1}°C", value);
        Ok(())
    }

    pub async fn set_gains(&self, gains: PidGains) -> Result<(), ControlError> {
        if !gains.is_finite() {
            return Err(ControlError::InvalidCommand("gains must be finite".to_string()));
        }
        let mut core = self.core.lock().await;
        core.pid.set_gains(gains);
        tracing::info!("PID gains set: Kp={:.3}, Ki={:.4}, Kd={:.3}", gains.kp, gains.ki, gains.kd);
        Ok(())
    }

    /// Latch the interlock, cancel any autotune and cut the fan.
    ///
    /// The latch holds even if the fan driver fails; the error is returned.
    pub async fn emergency_shutdown(&self) -> Result<(), ControlError> {
        let mut core = self.core.lock().await;
        core.autotune.abort(AutotuneFailure::Cancelled);
        let ControlCore { safety, pid, fan, .. } = &mut *core;
        safety.emergency_shutdown(pid, fan)?;
        Ok(())
    }

    pub async fn start_autotune(&self, target: f64) -> Result<(), ControlError> {
        let mut core = self.core.lock().await;
        if core.safety.is_shutdown() {
            return Err(AutotuneError::SafetyLatched.into());
        }
        let now = self.clock.now_monotonic();
        core.autotune.start(target, now)?;
        Ok(())
    }

    pub async fn cancel_autotune(&self) {
        let mut core = self.core.lock().await;
        let was_running = core.autotune.is_running();
        core.autotune.cancel();
        if was_running {
            core.pid.reset();
        }
    }

    pub async fn get_autotune_result(&self) -> Result<PidGains, ControlError> {
        let core = self.core.lock().await;
        Ok(core.autotune.result()?)
    }

    /// Copy a completed autotune result into the live PID gains.
    pub async fn apply_autotune_result(&self) -> Result<PidGains, ControlError> {
        let mut core = self.core.lock().await;
        let gains = core.autotune.result()?;
        core.pid.set_gains(gains);
        core.pid.reset();
        tracing::info!(
            "Applied autotune gains: Kp={:.3}, Ki={:.4}, Kd={:.3}",
            gains.kp,
            gains.ki,
            gains.kd
        );
        Ok(gains)
    }

    pub async fn register_probe(
        &self,
        config: &ProbeConfig,
        driver: Arc<dyn TemperatureProbe>,
    ) -> Result<ProbeId, ControlError> {
        let (id, probes) = {
            let mut sensors = self.sensors.lock().await;
            let id = sensors.register(config, driver)?;
            (id, sensors.statuses())
        };
        self.core.lock().await.probes = probes;
        Ok(id)
    }

    pub async fn deregister_probe(&self, id: &str) -> Result<(), ControlError> {
        let probes = {
            let mut sensors = self.sensors.lock().await;
            sensors.deregister(id)?;
            sensors.statuses()
        };
        self.core.lock().await.probes = probes;
        Ok(())
    }

    pub async fn set_probe_enabled(&self, id: &str, enabled: bool) -> Result<(), ControlError> {
        let probes = {
            let mut sensors = self.sensors.lock().await;
            sensors.set_enabled(id, enabled)?;
            sensors.statuses()
        };
        self.core.lock().await.probes = probes;
        Ok(())
    }

    pub async fn get_status(&self) -> ControlStatus {
        let core = self.core.lock().await;
        let level = core.fan.level();
        ControlStatus {
            device_name: self.settings.device_name.clone(),
            unit: TemperatureUnit::Celsius,
            aggregate_temperature: core.aggregate,
            probes: core.probes.clone(),
            fan_on: level.is_on(),
            fan_level: level.fraction(),
            fan_mode: core.fan.mode(),
            setpoint: core.pid.setpoint(),
            gains: core.pid.gains(),
            last_output: core.pid.last_output(),
            armed: core.safety.state() == SafetyState::Armed,
            disarmed: !core.pid.is_armed(),
            sensor_fault: core.sensor_fault,
            autotune: core.autotune.summary(),
            ticks: core.ticks,
            last_tick_at: core.last_tick_at,
        }
    }

    /// Recorded samples (per probe and aggregate) since `since`.
    pub fn recent_samples(&self, since: DateTime<Utc>) -> Vec<Sample> {
        self.history.since(since)
    }

    fn record(&self, wall: DateTime<Utc>, readings: &[ProbeReading], aggregate: Result<f64, AggregationError>) {
        let samples = readings
            .iter()
            .filter_map(|r| r.result.as_ref().ok().map(|v| Sample::new(wall, r.id.as_str(), *v)))
            .chain(aggregate.ok().map(|v| Sample::new(wall, AGGREGATE_SOURCE, v)));
        for sample in samples {
            for sink in &self.sinks {
                sink.record_sample(sample.clone());
            }
            self.history.record_sample(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::probe::{ProbeError, ProbeType};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct NullFan;

    impl FanDriver for NullFan {
        fn apply(&mut self, _level: ActuatorLevel) -> Result<(), ActuationError> {
            Ok(())
        }
    }

    struct SharedProbe(Arc<StdMutex<Result<f64, ProbeError>>>);

    #[async_trait]
    impl TemperatureProbe for SharedProbe {
        async fn read(&self) -> Result<f64, ProbeError> {
            self.0.lock().unwrap().clone()
        }
    }

    fn context() -> (ControlContext, Arc<ManualClock>) {
        let mut config = Config::default();
        config.control.gains = PidGains::new(1.0, 0.0, 0.0);
        let clock = Arc::new(ManualClock::new());
        let ctx = ControlContext::new(ControlSettings::from_config(&config), Box::new(NullFan), clock.clone());
        (ctx, clock)
    }

    async fn add_probe(ctx: &ControlContext, label: &str, location: &str, value: f64) -> Arc<StdMutex<Result<f64, ProbeError>>> {
        let cell = Arc::new(StdMutex::new(Ok(value)));
        let config = ProbeConfig {
            label: label.to_string(),
            probe_type: ProbeType::Resistance,
            location: location.to_string(),
            offset: 0.0,
            enabled: true,
        };
        ctx.register_probe(&config, Arc::new(SharedProbe(cell.clone()))).await.unwrap();
        cell
    }

    #[tokio::test]
    async fn test_status_distinguishes_disarmed_shutdown_and_fault() {
        let (ctx, clock) = context();
        let probe = add_probe(&ctx, "pit", "D18", 50.0).await;

        ctx.tick().await.unwrap();
        let status = ctx.get_status().await;
        assert!(status.armed);
        assert!(status.disarmed);
        assert!(status.sensor_fault.is_none());
        assert_eq!(status.aggregate_temperature, Some(50.0));

        *probe.lock().unwrap() = Err(ProbeError::Disconnected);
        clock.advance(Duration::from_secs(1));
        assert_eq!(
            ctx.tick().await.unwrap(),
            TickOutcome::SensorFault(AggregationError::NoValidReadings)
        );
        ctx.emergency_shutdown().await.unwrap();
        let status = ctx.get_status().await;
        assert!(!status.armed);
        assert!(status.disarmed);
        assert_eq!(status.sensor_fault, Some(AggregationError::NoValidReadings));
        assert_eq!(status.aggregate_temperature, None);
        assert_eq!(status.probes[0].consecutive_faults, 1);
    }

    #[tokio::test]
    async fn test_sensor_fault_holds_fan_off() {
        let (ctx, clock) = context();
        let probe = add_probe(&ctx, "pit", "D18", 50.0).await;
        ctx.set_setpoint(100.0).await.unwrap();
        ctx.tick().await.unwrap();
        assert!(ctx.get_status().await.fan_on);

        *probe.lock().unwrap() = Err(ProbeError::Timeout);
        clock.advance(Duration::from_secs(1));
        ctx.tick().await.unwrap();
        assert!(!ctx.get_status().await.fan_on);

        *probe.lock().unwrap() = Ok(60.0);
        clock.advance(Duration::from_secs(1));
        ctx.tick().await.unwrap();
        let status = ctx.get_status().await;
        assert!(status.fan_on);
        assert!(status.sensor_fault.is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_finite_commands() {
        let (ctx, _clock) = context();
        assert!(matches!(ctx.set_setpoint(f64::NAN).await, Err(ControlError::InvalidCommand(_))));
        assert!(matches!(
            ctx.set_gains(PidGains::new(f64::INFINITY, 0.0, 0.0)).await,
            Err(ControlError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_samples_recorded_in_history() {
        let (ctx, clock) = context();
        add_probe(&ctx, "a", "D18", 70.0).await;
        add_probe(&ctx, "b", "D19", 72.0).await;
        let since = clock.now_wallclock();
        ctx.tick().await.unwrap();
        let samples = ctx.recent_samples(since);
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[2].source, AGGREGATE_SOURCE);
        assert_eq!(samples[2].value, 71.0);
    }

    #[tokio::test]
    async fn test_status_in_fahrenheit() {
        let (ctx, _clock) = context();
        add_probe(&ctx, "pit", "D18", 100.0).await;
        ctx.set_setpoint(100.0).await.unwrap();
        ctx.tick().await.unwrap();
        let status = ctx.get_status().await.in_unit(TemperatureUnit::Fahrenheit);
        assert_eq!(status.unit, TemperatureUnit::Fahrenheit);
        assert!((status.setpoint - 212.0).abs() < 1e-9);
        assert!((status.aggregate_temperature.unwrap() - 212.0).abs() < 1e-9);
        assert!((status.probes[0].last_value.unwrap() - 212.0).abs() < 1e-9);
    }
}
