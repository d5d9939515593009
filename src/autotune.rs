// src/autotune.rs - Relay-feedback PID autotuning
//
// The relay drives the fan full on until the enclosure passes
// `target + noise_band`, then off until it drops below `target - noise_band`.
// The resulting limit cycle gives the ultimate gain and period, from which
// classic Ziegler-Nichols gains are derived.
use serde::Serialize;
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::AutotuneConfig;
use crate::pid::PidGains;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutotuneState {
    Idle,
    Running,
    Complete,
    Failed,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum AutotuneFailure {
    #[error("too many consecutive sensor faults")]
    SensorFault,
    #[error("sample/time budget exhausted before the loop oscillated")]
    BudgetExhausted,
    #[error("oscillation too small to estimate gains")]
    NoOscillation,
    #[error("cancelled by emergency shutdown")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutotuneError {
    #[error("an autotune session is already running")]
    AlreadyRunning,
    #[error("autotune target {0:.1}°C would disarm the controller")]
    InvalidTarget(f64),
    #[error("safety interlock is latched")]
    SafetyLatched,
    #[error("no autotune result available (state: {0:?})")]
    NotComplete(AutotuneState),
}

#[derive(Debug, Clone)]
pub struct AutotuneSettings {
    pub noise_band: f64,
    pub cycles: usize,
    pub max_samples: usize,
    pub max_duration: Duration,
    pub max_consecutive_faults: u32,
    /// PID output range; half of it is the relay amplitude.
    pub output_min: f64,
    pub output_max: f64,
    pub disarm_threshold: f64,
}

impl AutotuneSettings {
    pub fn from_config(config: &AutotuneConfig, output_min: f64, output_max: f64, disarm_threshold: f64) -> Self {
        Self {
            noise_band: config.noise_band,
            cycles: config.cycles.max(2),
            max_samples: config.max_samples,
            max_duration: Duration::from_secs(config.max_duration_secs),
            max_consecutive_faults: config.max_consecutive_faults,
            output_min,
            output_max,
            disarm_threshold,
        }
    }
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutotuneSummary {
    pub state: AutotuneState,
    pub target: Option<f64>,
    pub samples: usize,
    pub peaks: usize,
    pub valleys: usize,
    pub relay_on: bool,
    pub failure: Option<AutotuneFailure>,
    pub result: Option<PidGains>,
}

#[derive(Debug)]
pub struct Autotuner {
    settings: AutotuneSettings,
    state: AutotuneState,
    target: Option<f64>,
    started_at: Option<Instant>,
    samples: Vec<(f64, f64)>,
    peaks: Vec<(f64, f64)>,
    valleys: Vec<(f64, f64)>,
    extreme: Option<(f64, f64)>,
    half_cycles: usize,
    relay_on: bool,
    consecutive_faults: u32,
    result: Option<PidGains>,
    failure: Option<AutotuneFailure>,
}

impl Autotuner {
    pub fn new(settings: AutotuneSettings) -> Self {
        Self {
            settings,
            state: AutotuneState::Idle,
            target: None,
            started_at: None,
            samples: Vec::new(),
            peaks: Vec::new(),
            valleys: Vec::new(),
            extreme: None,
            half_cycles: 0,
            relay_on: false,
            consecutive_faults: 0,
            result: None,
            failure: None,
        }
    }

    pub fn state(&self) -> AutotuneState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == AutotuneState::Running
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    pub fn failure(&self) -> Option<AutotuneFailure> {
        self.failure
    }

    /// Gains from a completed session.
    pub fn result(&self) -> Result<PidGains, AutotuneError> {
        match (self.state, self.result) {
            (AutotuneState::Complete, Some(gains)) => Ok(gains),
            (state, _) => Err(AutotuneError::NotComplete(state)),
        }
    }

    /// Begin a new session, discarding any finished one.
    pub fn start(&mut self, target: f64, now: Instant) -> Result<(), AutotuneError> {
        if self.is_running() {
            return Err(AutotuneError::AlreadyRunning);
        }
        if !target.is_finite() || target <= self.settings.disarm_threshold {
            return Err(AutotuneError::InvalidTarget(target));
        }
        self.reset();
        self.state = AutotuneState::Running;
        self.target = Some(target);
        self.started_at = Some(now);
        self.relay_on = true;
        tracing::info!(
            "Autotune started: target {:.1}°C, band ±{:.2}°C, {} cycles",
            target,
            self.settings.noise_band,
            self.settings.cycles
        );
        Ok(())
    }

    /// Drop the session and return to `Idle`.
    pub fn cancel(&mut self) {
        if self.state != AutotuneState::Idle {
            tracing::info!("Autotune session discarded ({:?})", self.state);
        }
        self.reset();
    }

    /// Abort a running session into `Failed`. No-op otherwise.
    pub fn abort(&mut self, reason: AutotuneFailure) {
        if self.is_running() {
            self.fail(reason);
        }
    }

    /// Feed one aggregate temperature; returns whether the relay wants the fan on.
    pub fn observe(&mut self, now: Instant, temperature: f64) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.budget_exhausted(now) {
            self.finish_on_budget();
            return false;
        }
        let (Some(target), Some(started)) = (self.target, self.started_at) else {
            return false;
        };
        let t = now.saturating_duration_since(started).as_secs_f64();
        self.samples.push((t, temperature));
        self.consecutive_faults = 0;

        let band = self.settings.noise_band;
        if self.relay_on {
            // Heating: the valley is the lowest point since the relay closed.
            if self.extreme.is_none_or(|(_, v)| temperature < v) {
                self.extreme = Some((t, temperature));
            }
            if temperature > target + band {
                // The first heating phase starts from cold and has no real valley.
                if self.half_cycles > 0 {
                    if let Some(valley) = self.extreme {
                        tracing::debug!("Autotune valley {:.2}°C at {:.0}s", valley.1, valley.0);
                        self.valleys.push(valley);
                    }
                }
                self.half_cycles += 1;
                self.relay_on = false;
                self.extreme = Some((t, temperature));
            }
        } else {
            if self.extreme.is_none_or(|(_, v)| temperature > v) {
                self.extreme = Some((t, temperature));
            }
            if temperature < target - band {
                if let Some(peak) = self.extreme {
                    tracing::debug!("Autotune peak {:.2}°C at {:.0}s", peak.1, peak.0);
                    self.peaks.push(peak);
                }
                self.half_cycles += 1;
                self.relay_on = true;
                self.extreme = Some((t, temperature));
            }
        }

        let cycles = self.settings.cycles;
        if self.peaks.len() >= cycles && self.valleys.len() >= cycles {
            self.complete();
        }
        self.is_running() && self.relay_on
    }

    /// A tick with no usable temperature. The relay is held off.
    pub fn record_fault(&mut self, now: Instant) -> bool {
        if !self.is_running() {
            return false;
        }
        self.consecutive_faults += 1;
        if self.consecutive_faults > self.settings.max_consecutive_faults {
            self.fail(AutotuneFailure::SensorFault);
        } else if self.budget_exhausted(now) {
            self.finish_on_budget();
        }
        false
    }

    pub fn summary(&self) -> AutotuneSummary {
        AutotuneSummary {
            state: self.state,
            target: self.target,
            samples: self.samples.len(),
            peaks: self.peaks.len(),
            valleys: self.valleys.len(),
            relay_on: self.is_running() && self.relay_on,
            failure: self.failure,
            result: self.result,
        }
    }

    fn budget_exhausted(&self, now: Instant) -> bool {
        let elapsed = self
            .started_at
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        self.samples.len() >= self.settings.max_samples || elapsed >= self.settings.max_duration
    }

    fn finish_on_budget(&mut self) {
        if self.peaks.len() >= 2 && self.valleys.len() >= 2 {
            tracing::info!("Autotune budget reached, computing gains from partial data");
            self.complete();
        } else {
            self.fail(AutotuneFailure::BudgetExhausted);
        }
    }

    fn complete(&mut self) {
        match self.compute_gains() {
            Some(gains) => {
                tracing::info!(
                    "Autotune complete: Kp={:.3}, Ki={:.4}, Kd={:.3}",
                    gains.kp,
                    gains.ki,
                    gains.kd
                );
                self.state = AutotuneState::Complete;
                self.result = Some(gains);
                self.relay_on = false;
            }
            None => self.fail(AutotuneFailure::NoOscillation),
        }
    }

    fn fail(&mut self, reason: AutotuneFailure) {
        tracing::warn!("Autotune failed: {}", reason);
        self.state = AutotuneState::Failed;
        self.failure = Some(reason);
        self.result = None;
        self.relay_on = false;
    }

    fn compute_gains(&self) -> Option<PidGains> {
        if self.peaks.len() < 2 || self.valleys.is_empty() {
            return None;
        }
        // The first peak carries the heat-up overshoot; leave it out of the amplitude when we can.
        let amplitude_peaks = if self.peaks.len() > 2 { &self.peaks[1..] } else { &self.peaks[..] };
        let mean_peak = mean(amplitude_peaks.iter().map(|p| p.1));
        let mean_valley = mean(self.valleys.iter().map(|v| v.1));
        let amplitude = (mean_peak - mean_valley) / 2.0;

        let period = mean(self.peaks.windows(2).map(|w| w[1].0 - w[0].0));
        if !(amplitude > 0.0) || !(period > 0.0) {
            return None;
        }

        let relay_amplitude = (self.settings.output_max - self.settings.output_min) / 2.0;
        let ku = 4.0 * relay_amplitude / (PI * amplitude);
        let tu = period;
        tracing::debug!("Autotune: a={:.3}°C, Tu={:.1}s, Ku={:.3}", amplitude, tu, ku);

        Some(PidGains::new(0.6 * ku, 1.2 * ku / tu, 0.075 * ku * tu))
    }

    fn reset(&mut self) {
        self.state = AutotuneState::Idle;
        self.target = None;
        self.started_at = None;
        self.samples.clear();
        self.peaks.clear();
        self.valleys.clear();
        self.extreme = None;
        self.half_cycles = 0;
        self.relay_on = false;
        self.consecutive_faults = 0;
        self.result = None;
        self.failure = None;
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn settings() -> AutotuneSettings {
        AutotuneSettings {
            noise_band: 0.5,
            cycles: 4,
            max_samples: 5000,
            max_duration: Duration::from_secs(5000),
            max_consecutive_faults: 3,
            output_min: 0.0,
            output_max: 100.0,
            disarm_threshold: 0.0,
        }
    }

    /// First-order enclosure with a few ticks of sensor lag.
    struct Plant {
        temperature: f64,
        lag: VecDeque<f64>,
    }

    impl Plant {
        fn new() -> Self {
            Self { temperature: 20.0, lag: VecDeque::from(vec![20.0; 3]) }
        }

        fn step(&mut self, fan_on: bool) -> f64 {
            let heat = if fan_on { 2.0 } else { 0.0 };
            self.temperature += heat - 0.02 * (self.temperature - 20.0);
            self.lag.push_back(self.temperature);
            self.lag.pop_front().unwrap()
        }
    }

    #[test]
    fn test_relay_autotune_completes_on_plant() {
        let mut tuner = Autotuner::new(settings());
        let start = Instant::now();
        tuner.start(100.0, start).unwrap();

        let mut plant = Plant::new();
        let mut fan_on = true;
        let mut tick = 0u64;
        while tuner.is_running() && tick < 5000 {
            let measured = plant.step(fan_on);
            tick += 1;
            fan_on = tuner.observe(start + Duration::from_secs(tick), measured);
        }

        assert_eq!(tuner.state(), AutotuneState::Complete);
        let gains = tuner.result().unwrap();
        assert!(gains.kp > 0.0 && gains.ki > 0.0 && gains.kd > 0.0, "{:?}", gains);
        assert!(!tuner.relay_on());
        let summary = tuner.summary();
        assert!(summary.peaks >= 4 && summary.valleys >= 4);
    }

    #[test]
    fn test_start_rejects_while_running_and_bad_target() {
        let mut tuner = Autotuner::new(settings());
        assert_eq!(tuner.start(0.0, Instant::now()), Err(AutotuneError::InvalidTarget(0.0)));
        tuner.start(110.0, Instant::now()).unwrap();
        assert_eq!(tuner.start(120.0, Instant::now()), Err(AutotuneError::AlreadyRunning));
        assert!(matches!(tuner.result(), Err(AutotuneError::NotComplete(AutotuneState::Running))));
    }

    #[test]
    fn test_budget_exhaustion_fails_without_oscillation() {
        let mut tuner = Autotuner::new(AutotuneSettings { max_samples: 10, ..settings() });
        let start = Instant::now();
        tuner.start(200.0, start).unwrap();
        for tick in 1..=20u64 {
            tuner.observe(start + Duration::from_secs(tick), 20.0 + tick as f64);
        }
        assert_eq!(tuner.state(), AutotuneState::Failed);
        assert_eq!(tuner.failure(), Some(AutotuneFailure::BudgetExhausted));
        assert_eq!(tuner.samples().len(), 10);
        assert!(tuner.result().is_err());
    }

    #[test]
    fn test_sensor_faults_fail_session() {
        let mut tuner = Autotuner::new(settings());
        let start = Instant::now();
        tuner.start(100.0, start).unwrap();
        assert!(tuner.observe(start + Duration::from_secs(1), 30.0));
        for tick in 2..=4u64 {
            assert!(!tuner.record_fault(start + Duration::from_secs(tick)));
            assert!(tuner.is_running());
        }
        tuner.record_fault(start + Duration::from_secs(5));
        assert_eq!(tuner.failure(), Some(AutotuneFailure::SensorFault));
    }

    #[test]
    fn test_abort_and_restart() {
        let mut tuner = Autotuner::new(settings());
        tuner.start(100.0, Instant::now()).unwrap();
        tuner.abort(AutotuneFailure::Cancelled);
        assert_eq!(tuner.state(), AutotuneState::Failed);
        assert_eq!(tuner.failure(), Some(AutotuneFailure::Cancelled));

        // A finished session may be replaced by a new one.
        assert!(tuner.start(90.0, Instant::now()).is_ok());
        assert_eq!(tuner.target(), Some(90.0));
        tuner.cancel();
        assert_eq!(tuner.state(), AutotuneState::Idle);
        assert!(tuner.samples().is_empty());
    }
}
