//! Fixed-point telemetry frame codec
//!
//! Every reading is packed into exactly five bytes:
//! ```text
//! [ 2 bytes: latitude  (u16, big-endian) ]
//! [ 2 bytes: longitude (u16, big-endian) ]
//! [ 1 byte : battery percent             ]
//! ```
//!
//! Latitude maps `[-90, +90]` onto `[0, 65535]` and longitude maps
//! `[-180, +180]` onto `[0, 65535]`, rounding to the nearest step. That is a
//! resolution of roughly 0.0027° latitude and 0.0055° longitude.
//!
//! On the wire the frame travels as 10 uppercase hex characters.

use std::fmt;

use thiserror::Error;

/// Size of an encoded frame in bytes
pub const FRAME_LEN: usize = 5;

/// Size of a hex-rendered frame in characters
pub const FRAME_HEX_LEN: usize = FRAME_LEN * 2;

const LAT_SPAN: f64 = 180.0;
const LON_SPAN: f64 = 360.0;
const SCALE: f64 = u16::MAX as f64;

/// Highest battery percentage accepted by the encoder
pub const BATTERY_MAX: u8 = 100;

/// Errors that can occur while encoding, decoding or rendering frames
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Latitude out of range: {0} (expected -90..=90)")]
    LatitudeOutOfRange(f64),

    #[error("Longitude out of range: {0} (expected -180..=180)")]
    LongitudeOutOfRange(f64),

    #[error("Battery out of range: {0}% (max: {BATTERY_MAX})")]
    BatteryOutOfRange(u8),

    #[error("Invalid frame length: {0} bytes (expected {FRAME_LEN})")]
    InvalidLength(usize),

    #[error("Invalid hex payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Timestamp not representable in local time: {0}")]
    InvalidTimestamp(i64),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One sample taken from the sensors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    /// Degrees, -90..=90
    pub latitude: f64,
    /// Degrees, -180..=180
    pub longitude: f64,
    /// Percent, 0..=100
    pub battery: u8,
    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

/// Values recovered from a frame, quantized to the frame resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedFrame {
    pub latitude: f64,
    pub longitude: f64,
    pub battery: u8,
}

/// An encoded telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TelemetryFrame([u8; FRAME_LEN]);

impl TelemetryFrame {
    /// Raw frame bytes
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }

    /// Render as 10 uppercase hex characters, no separator
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse a hex-rendered frame (case-insensitive)
    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(s.trim())?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for TelemetryFrame {
    type Error = CodecError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; FRAME_LEN] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidLength(bytes.len()))?;
        Ok(Self(raw))
    }
}

impl fmt::Display for TelemetryFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Encode a reading into a frame
///
/// Coordinates outside their valid range (or NaN) and battery levels above
/// 100 are rejected rather than clamped or wrapped.
pub fn encode(reading: &TelemetryReading) -> Result<TelemetryFrame, CodecError> {
    if !(-90.0..=90.0).contains(&reading.latitude) {
        return Err(CodecError::LatitudeOutOfRange(reading.latitude));
    }
    if !(-180.0..=180.0).contains(&reading.longitude) {
        return Err(CodecError::LongitudeOutOfRange(reading.longitude));
    }
    if reading.battery > BATTERY_MAX {
        return Err(CodecError::BatteryOutOfRange(reading.battery));
    }

    let lat = scale(reading.latitude + 90.0, LAT_SPAN);
    let lon = scale(reading.longitude + 180.0, LON_SPAN);

    let mut raw = [0u8; FRAME_LEN];
    raw[0..2].copy_from_slice(&lat.to_be_bytes());
    raw[2..4].copy_from_slice(&lon.to_be_bytes());
    raw[4] = reading.battery;

    Ok(TelemetryFrame(raw))
}

/// Decode a frame back into quantized coordinates and battery level
pub fn decode(frame: &TelemetryFrame) -> DecodedFrame {
    let raw = frame.as_bytes();
    let lat = u16::from_be_bytes([raw[0], raw[1]]);
    let lon = u16::from_be_bytes([raw[2], raw[3]]);

    DecodedFrame {
        latitude: unscale(lat, LAT_SPAN) - 90.0,
        longitude: unscale(lon, LON_SPAN) - 180.0,
        battery: raw[4],
    }
}

fn scale(offset: f64, span: f64) -> u16 {
    // offset is already range-checked, so the product lies in 0..=65535
    (offset / span * SCALE).round() as u16
}

fn unscale(value: u16, span: f64) -> f64 {
    value as f64 / SCALE * span
}
