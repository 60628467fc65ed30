//! Transport trait abstraction for the two delivery backends

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Transient delivery failures; the caller logs and moves on
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Session or link not ready; nothing was sent
    #[error("Transport not ready ({0})")]
    InvalidState(String),

    /// Session went away while the message was queued
    #[error("Session closed before the message was written")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] telemetry_shared::mqtt::MqttError),
}

/// Persistent session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Session object exists but is not connected
    Initialized,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Initialized => write!(f, "initialized"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

/// Uniform delivery capability offered by both transports
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one telemetry body; no retry, no queuing
    async fn deliver(&self, body: &[u8]) -> std::result::Result<(), DeliveryError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Lifecycle hooks the link manager drives on a persistent session
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Create the session object; called once when the link driver starts
    fn init(&self) -> Result<()>;

    /// Start connecting; completion arrives as a session event
    async fn connect(&self) -> Result<()>;

    /// Drop the session back to initialized
    async fn teardown(&self);
}
