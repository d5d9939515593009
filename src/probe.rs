// src/probe.rs - Probe capability, probe kinds and hardware locations
//
// Drivers for the physical sensors live outside the control core. The core
// only sees `TemperatureProbe`, plus the validated `ProbeKind` describing
// which bus resource a probe sits on.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A temperature source that already returns calibrated-by-driver Celsius.
#[async_trait]
pub trait TemperatureProbe: Send + Sync {
    async fn read(&self) -> Result<f64, ProbeError>;
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum ProbeError {
    #[error("probe read timed out")]
    Timeout,
    #[error("driver error: {0}")]
    Driver(String),
    #[error("probe returned a non-finite reading")]
    InvalidReading,
    #[error("probe disconnected")]
    Disconnected,
}

/// Probe technology names as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeType {
    Resistance,
    Thermocouple,
    ThermocoupleHighPrecision,
    AnalogVoltage,
    HumidityCombo,
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeType::Resistance => "resistance",
            ProbeType::Thermocouple => "thermocouple",
            ProbeType::ThermocoupleHighPrecision => "thermocouple-high-precision",
            ProbeType::AnalogVoltage => "analog-voltage",
            ProbeType::HumidityCombo => "humidity-combo",
        };
        f.write_str(name)
    }
}

/// A probe type together with its parsed hardware location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProbeKind {
    /// RTD amplifier on SPI, selected by a chip-select GPIO.
    Resistance { chip_select: u8 },
    /// Thermocouple amplifier on SPI.
    Thermocouple { chip_select: u8, high_precision: bool },
    /// One channel of an ADS1115-style ADC on I2C.
    AnalogVoltage { address: u8, channel: u8 },
    /// Combined temperature/humidity sensor on I2C.
    HumidityCombo { address: u8 },
}

/// A bus resource a probe occupies. Two probes may not hold conflicting claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareClaim {
    Gpio(u8),
    AdcChannel { address: u8, channel: u8 },
    I2cDevice(u8),
}

impl HardwareClaim {
    pub fn conflicts_with(&self, other: &HardwareClaim) -> bool {
        match (self, other) {
            (HardwareClaim::Gpio(a), HardwareClaim::Gpio(b)) => a == b,
            (
                HardwareClaim::AdcChannel { address: a, channel: ca },
                HardwareClaim::AdcChannel { address: b, channel: cb },
            ) => a == b && ca == cb,
            // A whole-device claim blocks every channel on that address.
            (HardwareClaim::I2cDevice(a), HardwareClaim::I2cDevice(b)) => a == b,
            (HardwareClaim::I2cDevice(a), HardwareClaim::AdcChannel { address, .. })
            | (HardwareClaim::AdcChannel { address, .. }, HardwareClaim::I2cDevice(a)) => a == address,
            _ => false,
        }
    }
}

const MAX_GPIO: u8 = 27;
const ADC_ADDRESSES: std::ops::RangeInclusive<u8> = 0x48..=0x4B;
const I2C_ADDRESSES: std::ops::RangeInclusive<u8> = 0x03..=0x77;

impl ProbeKind {
    /// Validate a configured location against the probe type.
    ///
    /// Accepted forms:
    /// - SPI types: `D18`, `GPIO18` or `18`
    /// - `analog-voltage`: `0x48:P0` (or `0x48:0`)
    /// - `humidity-combo`: `0x44`
    pub fn parse(probe_type: ProbeType, location: &str) -> Result<Self, String> {
        let location = location.trim();
        match probe_type {
            ProbeType::Resistance => Ok(ProbeKind::Resistance {
                chip_select: parse_gpio(location)?,
            }),
            ProbeType::Thermocouple => Ok(ProbeKind::Thermocouple {
                chip_select: parse_gpio(location)?,
                high_precision: false,
            }),
            ProbeType::ThermocoupleHighPrecision => Ok(ProbeKind::Thermocouple {
                chip_select: parse_gpio(location)?,
                high_precision: true,
            }),
            ProbeType::AnalogVoltage => {
                let (addr, chan) = location
                    .split_once(':')
                    .ok_or_else(|| format!("expected ADDRESS:CHANNEL, got '{}'", location))?;
                let address = parse_hex_address(addr)?;
                if !ADC_ADDRESSES.contains(&address) {
                    return Err(format!("ADC address {:#04x} outside 0x48..=0x4b", address));
                }
                let chan = chan.trim();
                let chan = chan.strip_prefix('P').or_else(|| chan.strip_prefix('p')).unwrap_or(chan);
                let channel: u8 = chan
                    .parse()
                    .map_err(|_| format!("invalid ADC channel '{}'", chan))?;
                if channel > 3 {
                    return Err(format!("ADC channel {} outside P0..=P3", channel));
                }
                Ok(ProbeKind::AnalogVoltage { address, channel })
            }
            ProbeType::HumidityCombo => {
                let address = parse_hex_address(location)?;
                if !I2C_ADDRESSES.contains(&address) {
                    return Err(format!("I2C address {:#04x} outside 0x03..=0x77", address));
                }
                Ok(ProbeKind::HumidityCombo { address })
            }
        }
    }

    pub fn probe_type(&self) -> ProbeType {
        match self {
            ProbeKind::Resistance { .. } => ProbeType::Resistance,
            ProbeKind::Thermocouple { high_precision: false, .. } => ProbeType::Thermocouple,
            ProbeKind::Thermocouple { high_precision: true, .. } => ProbeType::ThermocoupleHighPrecision,
            ProbeKind::AnalogVoltage { .. } => ProbeType::AnalogVoltage,
            ProbeKind::HumidityCombo { .. } => ProbeType::HumidityCombo,
        }
    }

    pub fn claim(&self) -> HardwareClaim {
        match *self {
            ProbeKind::Resistance { chip_select } | ProbeKind::Thermocouple { chip_select, .. } => {
                HardwareClaim::Gpio(chip_select)
            }
            ProbeKind::AnalogVoltage { address, channel } => HardwareClaim::AdcChannel { address, channel },
            ProbeKind::HumidityCombo { address } => HardwareClaim::I2cDevice(address),
        }
    }
}

fn parse_gpio(location: &str) -> Result<u8, String> {
    let digits = location
        .strip_prefix("GPIO")
        .or_else(|| location.strip_prefix('D'))
        .unwrap_or(location);
    let pin: u8 = digits
        .parse()
        .map_err(|_| format!("invalid GPIO pin '{}'", location))?;
    if pin > MAX_GPIO {
        return Err(format!("GPIO pin {} outside 0..={}", pin, MAX_GPIO));
    }
    Ok(pin)
}

fn parse_hex_address(text: &str) -> Result<u8, String> {
    let text = text.trim();
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .ok_or_else(|| format!("expected hex address like 0x48, got '{}'", text))?;
    u8::from_str_radix(hex, 16).map_err(|_| format!("invalid hex address '{}'", text))
}
