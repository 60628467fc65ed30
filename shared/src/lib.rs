//! Telemetry Node Shared Types
//!
//! This crate provides the pure, I/O-free pieces of the telemetry node:
//! the 5-byte frame codec, the JSON envelope both transports carry, the
//! link state machine, and the MQTT packet codec used by the persistent
//! session.

pub mod codec;
pub mod envelope;
pub mod mqtt;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use codec::{CodecError, DecodedFrame, TelemetryFrame, TelemetryReading};
pub use envelope::TelemetryEnvelope;
pub use state_machine::{LinkAction, LinkEvent, LinkState, LinkStateMachine, TransportMode};

/// Get current timestamp in seconds since Unix epoch
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Link and supervision parameters
pub mod link {
    /// Seconds added to the retry delay per consecutive disconnection
    pub const BACKOFF_STEP_SECS: u64 = 2;

    /// Time allowed to become established after boot before a restart
    pub const ESTABLISH_TIMEOUT_SECS: u64 = 300;

    /// Delay before reconnecting a dropped session while the link is up
    pub const SESSION_RECONNECT_SECS: u64 = 10;

    /// Default telemetry sampling period
    pub const TELEMETRY_INTERVAL_SECS: u64 = 60;

    /// Default MQTT topic namespace
    pub const TOPIC_NAMESPACE: &str = "tc-bn";
}
