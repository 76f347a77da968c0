//! Sensor model and reading generation.
//!
//! A reading is produced from a device's identity, its caller-owned sequence
//! counter, an injected random source and an injected clock. Nothing in this
//! module touches global randomness or wall time directly.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ParseError;

/// Format used for reading timestamps (ISO-8601, microsecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Physical location of a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    CityCenter,
    ParkNorth,
    IndustrialZone,
    #[serde(rename = "street_123")]
    Street123,
}

impl Location {
    pub const ALL: [Location; 4] = [
        Location::CityCenter,
        Location::ParkNorth,
        Location::IndustrialZone,
        Location::Street123,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::CityCenter => "city_center",
            Location::ParkNorth => "park_north",
            Location::IndustrialZone => "industrial_zone",
            Location::Street123 => "street_123",
        }
    }

    /// Pick a location uniformly at random.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&Location::CityCenter)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| ParseError::MalformedPayload(format!("unknown location '{}'", s)))
    }
}

/// Kind of measurement a device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Temperature,
    Humidity,
    Pressure,
    AirQuality,
}

impl SensorType {
    pub const ALL: [SensorType; 4] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::Pressure,
        SensorType::AirQuality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Pressure => "pressure",
            SensorType::AirQuality => "air_quality",
        }
    }

    /// Closed value range `(min, max)` for this sensor type.
    ///
    /// Temperature in °C, humidity in %, pressure in hPa, air quality as AQI.
    pub fn range(&self) -> (f64, f64) {
        match self {
            SensorType::Temperature => (20.0, 40.0),
            SensorType::Humidity => (40.0, 90.0),
            SensorType::Pressure => (900.0, 1100.0),
            SensorType::AirQuality => (0.0, 500.0),
        }
    }

    /// Pick a sensor type uniformly at random.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        *Self::ALL.choose(rng).unwrap_or(&SensorType::Temperature)
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseError::MalformedPayload(format!("unknown sensor type '{}'", s)))
    }
}

/// Fixed `(location, sensor_type)` pair given to a publisher.
///
/// Parses from `"location,sensor_type"`, e.g. `"park_north,humidity"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub location: Location,
    pub sensor_type: SensorType,
}

impl Assignment {
    pub fn new(location: Location, sensor_type: SensorType) -> Self {
        Self {
            location,
            sensor_type,
        }
    }

    /// Pick both halves uniformly at random.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::new(Location::random(rng), SensorType::random(rng))
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.location, self.sensor_type)
    }
}

impl FromStr for Assignment {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (location, sensor_type) = s.split_once(',').ok_or_else(|| {
            ParseError::MalformedPayload(format!(
                "expected 'location,sensor_type', got '{}'",
                s
            ))
        })?;
        Ok(Self::new(location.trim().parse()?, sensor_type.trim().parse()?))
    }
}

/// One telemetry sample as it travels on the wire.
///
/// Field names on the wire are `id, location, sensor_type, packet_no, value, timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "id", deserialize_with = "deserialize_device_id")]
    pub device_id: String,
    pub location: Location,
    pub sensor_type: SensorType,
    #[serde(rename = "packet_no")]
    pub sequence_no: u64,
    pub value: f64,
    pub timestamp: String,
}

impl SensorReading {
    /// Encode as a UTF-8 JSON payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from a UTF-8 JSON payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self, ParseError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Older publishers emit the device id as a bare number.
fn deserialize_device_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

/// Source of reading timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// Produces sensor readings.
///
/// The generator itself holds no per-device state: the sequence number is
/// owned by the caller's publish loop and the random source is passed in.
#[derive(Clone)]
pub struct SensorDataGenerator {
    clock: Arc<dyn Clock>,
}

impl SensorDataGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Generate one reading with a value drawn uniformly from the type's range.
    pub fn next<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        device_id: &str,
        location: Location,
        sensor_type: SensorType,
        sequence_no: u64,
    ) -> SensorReading {
        let (min, max) = sensor_type.range();
        let value = round2(rng.gen_range(min..=max));

        SensorReading {
            device_id: device_id.to_string(),
            location,
            sensor_type,
            sequence_no,
            value,
            timestamp: self.clock.now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl Default for SensorDataGenerator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
