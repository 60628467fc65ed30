//! JSON envelope carried by both transports
//!
//! ```text
//! {"id":"<device-id>","payload":"<10 hex chars>","date":"YYYY-MM-DD","time":"HH:MM:SS"}
//! ```

use std::fmt;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, TelemetryFrame};

/// Wire envelope for one telemetry frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub id: String,
    pub payload: String,
    pub date: String,
    pub time: String,
}

impl TelemetryEnvelope {
    /// Build an envelope, rendering the timestamp in the host's local time
    pub fn new(
        device_id: impl Into<String>,
        frame: &TelemetryFrame,
        timestamp: i64,
    ) -> Result<Self, CodecError> {
        Self::with_timezone(device_id, frame, timestamp, &Local)
    }

    /// Build an envelope, rendering the timestamp in the given time zone
    pub fn with_timezone<Tz: TimeZone>(
        device_id: impl Into<String>,
        frame: &TelemetryFrame,
        timestamp: i64,
        tz: &Tz,
    ) -> Result<Self, CodecError>
    where
        Tz::Offset: fmt::Display,
    {
        let local = tz
            .timestamp_opt(timestamp, 0)
            .earliest()
            .ok_or(CodecError::InvalidTimestamp(timestamp))?;

        Ok(Self {
            id: device_id.into(),
            payload: frame.to_hex(),
            date: local.format("%Y-%m-%d").to_string(),
            time: local.format("%H:%M:%S").to_string(),
        })
    }

    /// Compact JSON rendering used as the transport body
    pub fn to_json(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope from JSON
    pub fn from_json(s: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Recover the frame carried in `payload`
    pub fn frame(&self) -> Result<TelemetryFrame, CodecError> {
        TelemetryFrame::from_hex(&self.payload)
    }
}
