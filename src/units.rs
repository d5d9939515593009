// src/units.rs - Presentation units for temperatures
//
// Everything inside the control loop is Celsius. Conversion happens only at
// the edges (console input, status rendering).
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    /// Convert a Celsius value into this unit.
    pub fn from_celsius(self, celsius: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => celsius,
            TemperatureUnit::Fahrenheit => celsius * 9.0 / 5.0 + 32.0,
        }
    }

    /// Convert a value expressed in this unit into Celsius.
    pub fn to_celsius(self, value: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => value,
            TemperatureUnit::Fahrenheit => (value - 32.0) * 5.0 / 9.0,
        }
    }

    /// Convert a temperature *difference* (offsets, bands) into this unit.
    pub fn delta_from_celsius(self, delta: f64) -> f64 {
        match self {
            TemperatureUnit::Celsius => delta,
            TemperatureUnit::Fahrenheit => delta * 9.0 / 5.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }
}

impl fmt::Display for TemperatureUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fahrenheit_conversion() {
        let unit = TemperatureUnit::Fahrenheit;
        assert!((unit.from_celsius(100.0) - 212.0).abs() < 1e-9);
        assert!((unit.to_celsius(32.0)).abs() < 1e-9);
        assert!((unit.delta_from_celsius(10.0) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_celsius_is_identity() {
        let unit = TemperatureUnit::Celsius;
        assert_eq!(unit.from_celsius(72.5), 72.5);
        assert_eq!(unit.to_celsius(72.5), 72.5);
    }
}
