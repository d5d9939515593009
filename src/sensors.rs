// src/sensors.rs - Probe registry, concurrent polling and aggregation
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ProbeConfig;
use crate::probe::{ProbeError, ProbeKind, ProbeType, TemperatureProbe};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("probe label must not be blank")]
    EmptyLabel,
    #[error("probe label '{0}' is already registered")]
    DuplicateLabel(String),
    #[error("probe '{label}' has an invalid location: {reason}")]
    InvalidLocation { label: String, reason: String },
    #[error("no probe registered as '{0}'")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum AggregationError {
    #[error("no valid probe readings")]
    NoValidReadings,
}

/// Stable probe identifier (the configured label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ProbeId(String);

impl ProbeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProbeId {
    fn from(label: &str) -> Self {
        ProbeId(label.to_string())
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One probe's result for a single poll, offset already applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReading {
    pub id: ProbeId,
    pub result: Result<f64, ProbeError>,
}

impl ProbeReading {
    pub fn ok(id: &str, value: f64) -> Self {
        Self { id: ProbeId::from(id), result: Ok(value) }
    }

    pub fn err(id: &str, error: ProbeError) -> Self {
        Self { id: ProbeId::from(id), result: Err(error) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimedReading {
    pub value: f64,
    pub at: DateTime<Utc>,
}

pub struct ProbeRecord {
    pub id: ProbeId,
    pub kind: ProbeKind,
    pub offset: f64,
    pub enabled: bool,
    pub last_reading: Option<TimedReading>,
    pub fault: Option<ProbeError>,
    pub consecutive_faults: u32,
    driver: Arc<dyn TemperatureProbe>,
}

impl fmt::Debug for ProbeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRecord")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("enabled", &self.enabled)
            .field("last_reading", &self.last_reading)
            .field("fault", &self.fault)
            .finish()
    }
}

/// Per-probe view for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeStatus {
    pub id: ProbeId,
    pub probe_type: ProbeType,
    pub enabled: bool,
    pub offset: f64,
    pub last_value: Option<f64>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub fault: Option<String>,
    pub consecutive_faults: u32,
}

pub struct SensorAggregator {
    records: Vec<ProbeRecord>,
    read_timeout: Duration,
}

impl SensorAggregator {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            records: Vec::new(),
            read_timeout,
        }
    }

    /// Validate a probe configuration and add it to the poll set.
    pub fn register(
        &mut self,
        config: &ProbeConfig,
        driver: Arc<dyn TemperatureProbe>,
    ) -> Result<ProbeId, RegistrationError> {
        let label = config.label.trim();
        if label.is_empty() {
            return Err(RegistrationError::EmptyLabel);
        }
        if self.records.iter().any(|r| r.id.as_str() == label) {
            return Err(RegistrationError::DuplicateLabel(label.to_string()));
        }
        let kind = ProbeKind::parse(config.probe_type, &config.location).map_err(|reason| {
            RegistrationError::InvalidLocation { label: label.to_string(), reason }
        })?;
        if let Some(owner) = self
            .records
            .iter()
            .find(|r| r.kind.claim().conflicts_with(&kind.claim()))
        {
            return Err(RegistrationError::InvalidLocation {
                label: label.to_string(),
                reason: format!("'{}' is already claimed by probe '{}'", config.location, owner.id),
            });
        }

        let id = ProbeId::from(label);
        tracing::info!(
            "Registered {} probe '{}' at {} (offset {:+.2}°C{})",
            config.probe_type,
            id,
            config.location,
            config.offset,
            if config.enabled { "" } else { ", disabled" }
        );
        self.records.push(ProbeRecord {
            id: id.clone(),
            kind,
            offset: config.offset,
            enabled: config.enabled,
            last_reading: None,
            fault: None,
            consecutive_faults: 0,
            driver,
        });
        Ok(id)
    }

    pub fn deregister(&mut self, id: &str) -> Result<(), RegistrationError> {
        let index = self
            .records
            .iter()
            .position(|r| r.id.as_str() == id)
            .ok_or_else(|| RegistrationError::NotFound(id.to_string()))?;
        self.records.remove(index);
        tracing::info!("Deregistered probe '{}'", id);
        Ok(())
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), RegistrationError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id.as_str() == id)
            .ok_or_else(|| RegistrationError::NotFound(id.to_string()))?;
        record.enabled = enabled;
        if !enabled {
            record.fault = None;
            record.consecutive_faults = 0;
        }
        tracing::info!("Probe '{}' {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProbeRecord] {
        &self.records
    }

    /// Read every enabled probe concurrently, each bounded by the read timeout.
    pub async fn poll(&mut self, now: DateTime<Utc>) -> Vec<ProbeReading> {
        let read_timeout = self.read_timeout;
        let reads = self.records.iter().filter(|r| r.enabled).map(|record| {
            let driver = record.driver.clone();
            let id = record.id.clone();
            async move {
                let result = match tokio::time::timeout(read_timeout, driver.read()).await {
                    Ok(Ok(value)) if value.is_finite() => Ok(value),
                    Ok(Ok(_)) => Err(ProbeError::InvalidReading),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ProbeError::Timeout),
                };
                (id, result)
            }
        });
        let raw = join_all(reads).await;

        let mut readings = Vec::with_capacity(raw.len());
        for (id, result) in raw {
            let Some(record) = self.records.iter_mut().find(|r| r.id == id) else {
                continue;
            };
            let result = result.map(|value| value + record.offset);
            match &result {
                Ok(value) => {
                    if record.fault.take().is_some() {
                        tracing::info!("Probe '{}' recovered after {} faulted reads", id, record.consecutive_faults);
                    }
                    record.consecutive_faults = 0;
                    record.last_reading = Some(TimedReading { value: *value, at: now });
                }
                Err(e) => {
                    if record.fault.is_none() {
                        tracing::warn!("Probe '{}' fault: {}", id, e);
                    } else {
                        tracing::debug!("Probe '{}' still faulted: {}", id, e);
                    }
                    record.fault = Some(e.clone());
                    record.consecutive_faults = record.consecutive_faults.saturating_add(1);
                }
            }
            readings.push(ProbeReading { id, result });
        }
        readings
    }

    /// Mean of all successful readings.
    pub fn aggregate(readings: &[ProbeReading]) -> Result<f64, AggregationError> {
        let (sum, count) = readings
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
        if count == 0 {
            return Err(AggregationError::NoValidReadings);
        }
        Ok(sum / count as f64)
    }

    pub fn statuses(&self) -> Vec<ProbeStatus> {
        self.records
            .iter()
            .map(|r| ProbeStatus {
                id: r.id.clone(),
                probe_type: r.kind.probe_type(),
                enabled: r.enabled,
                offset: r.offset,
                last_value: r.last_reading.map(|t| t.value),
                last_read_at: r.last_reading.map(|t| t.at),
                fault: r.fault.as_ref().map(|e| e.to_string()),
                consecutive_faults: r.consecutive_faults,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedProbe(Mutex<Result<f64, ProbeError>>);

    impl FixedProbe {
        fn new(result: Result<f64, ProbeError>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(result)))
        }

        fn set(&self, result: Result<f64, ProbeError>) {
            *self.0.lock().unwrap() = result;
        }
    }

    #[async_trait]
    impl TemperatureProbe for FixedProbe {
        async fn read(&self) -> Result<f64, ProbeError> {
            self.0.lock().unwrap().clone()
        }
    }

    struct StuckProbe;

    #[async_trait]
    impl TemperatureProbe for StuckProbe {
        async fn read(&self) -> Result<f64, ProbeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(20.0)
        }
    }

    fn probe(label: &str, probe_type: ProbeType, location: &str, offset: f64) -> ProbeConfig {
        ProbeConfig {
            label: label.to_string(),
            probe_type,
            location: location.to_string(),
            offset,
            enabled: true,
        }
    }

    #[test]
    fn test_aggregate_mean() {
        let readings = vec![
            ProbeReading::ok("a", 70.0),
            ProbeReading::ok("b", 72.0),
            ProbeReading::ok("c", 74.0),
        ];
        assert_eq!(SensorAggregator::aggregate(&readings), Ok(72.0));
    }

    #[test]
    fn test_aggregate_skips_faults() {
        let readings = vec![
            ProbeReading::ok("a", 70.0),
            ProbeReading::ok("b", 72.0),
            ProbeReading::err("c", ProbeError::Timeout),
        ];
        assert_eq!(SensorAggregator::aggregate(&readings), Ok(71.0));
    }

    #[test]
    fn test_aggregate_all_faulted() {
        let readings = vec![
            ProbeReading::err("a", ProbeError::Disconnected),
            ProbeReading::err("b", ProbeError::Timeout),
        ];
        assert_eq!(
            SensorAggregator::aggregate(&readings),
            Err(AggregationError::NoValidReadings)
        );
        assert_eq!(SensorAggregator::aggregate(&[]), Err(AggregationError::NoValidReadings));
    }

    #[test]
    fn test_register_rejects_duplicates_and_claims() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(100));
        let driver = FixedProbe::new(Ok(20.0));
        sensors
            .register(&probe("pit", ProbeType::Resistance, "D18", 0.0), driver.clone())
            .unwrap();

        let err = sensors
            .register(&probe("pit", ProbeType::Thermocouple, "D5", 0.0), driver.clone())
            .unwrap_err();
        assert_eq!(err, RegistrationError::DuplicateLabel("pit".to_string()));

        let err = sensors
            .register(&probe("meat", ProbeType::Thermocouple, "GPIO18", 0.0), driver.clone())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidLocation { .. }));

        let err = sensors
            .register(&probe("ambient", ProbeType::AnalogVoltage, "P0", 0.0), driver.clone())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidLocation { .. }));
        assert_eq!(sensors.len(), 1);
    }

    #[test]
    fn test_register_rejects_blank_label() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(100));
        for label in ["", "   ", "\t"] {
            let err = sensors
                .register(&probe(label, ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(1.0)))
                .unwrap_err();
            assert_eq!(err, RegistrationError::EmptyLabel);
        }
        assert!(sensors.is_empty());
        // Surrounding whitespace is trimmed from an otherwise valid label.
        let id = sensors
            .register(&probe(" pit ", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(1.0)))
            .unwrap();
        assert_eq!(id.as_str(), "pit");
    }

    #[test]
    fn test_deregister() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(100));
        sensors
            .register(&probe("pit", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(1.0)))
            .unwrap();
        assert!(sensors.deregister("pit").is_ok());
        assert_eq!(
            sensors.deregister("pit"),
            Err(RegistrationError::NotFound("pit".to_string()))
        );
        // The location is free again.
        assert!(sensors
            .register(&probe("pit2", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(1.0)))
            .is_ok());
    }

    #[tokio::test]
    async fn test_poll_applies_offsets_and_tracks_faults() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(100));
        let a = FixedProbe::new(Ok(70.0));
        let b = FixedProbe::new(Ok(71.0));
        sensors.register(&probe("a", ProbeType::Resistance, "D18", 1.0), a.clone()).unwrap();
        sensors.register(&probe("b", ProbeType::AnalogVoltage, "0x48:P0", 0.0), b.clone()).unwrap();

        let readings = sensors.poll(Utc::now()).await;
        assert_eq!(readings, vec![ProbeReading::ok("a", 71.0), ProbeReading::ok("b", 71.0)]);
        assert_eq!(SensorAggregator::aggregate(&readings), Ok(71.0));

        b.set(Err(ProbeError::Driver("spi".to_string())));
        let readings = sensors.poll(Utc::now()).await;
        assert!(readings[1].result.is_err());
        let statuses = sensors.statuses();
        assert_eq!(statuses[1].consecutive_faults, 1);
        assert_eq!(statuses[1].last_value, Some(71.0));
        assert!(statuses[1].fault.is_some());

        b.set(Ok(72.0));
        sensors.poll(Utc::now()).await;
        let statuses = sensors.statuses();
        assert_eq!(statuses[1].consecutive_faults, 0);
        assert!(statuses[1].fault.is_none());
    }

    #[tokio::test]
    async fn test_poll_times_out_stuck_probe() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(50));
        sensors
            .register(&probe("good", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(100.0)))
            .unwrap();
        sensors
            .register(&probe("stuck", ProbeType::HumidityCombo, "0x44", 0.0), Arc::new(StuckProbe))
            .unwrap();

        let started = std::time::Instant::now();
        let readings = sensors.poll(Utc::now()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(readings[0].result, Ok(100.0));
        assert_eq!(readings[1].result, Err(ProbeError::Timeout));
        // Timeouts fault the probe for this tick only; it stays enabled.
        assert!(sensors.records()[1].enabled);
    }

    #[tokio::test]
    async fn test_disabled_probe_not_polled() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(50));
        sensors
            .register(&probe("a", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(10.0)))
            .unwrap();
        sensors
            .register(&probe("b", ProbeType::Resistance, "D19", 0.0), FixedProbe::new(Ok(30.0)))
            .unwrap();
        sensors.set_enabled("b", false).unwrap();
        let readings = sensors.poll(Utc::now()).await;
        assert_eq!(readings, vec![ProbeReading::ok("a", 10.0)]);
    }

    #[tokio::test]
    async fn test_non_finite_reading_is_a_fault() {
        let mut sensors = SensorAggregator::new(Duration::from_millis(50));
        sensors
            .register(&probe("a", ProbeType::Resistance, "D18", 0.0), FixedProbe::new(Ok(f64::NAN)))
            .unwrap();
        let readings = sensors.poll(Utc::now()).await;
        assert_eq!(readings[0].result, Err(ProbeError::InvalidReading));
    }
}
